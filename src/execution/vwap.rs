//! Volume-weighted average price: schedules slices proportional to a
//! historical volume profile, tracks a benchmark VWAP for deviation
//! reporting, and supports adaptive re-planning when fills diverge from
//! the plan.

use std::collections::HashMap;

use serde_json::json;

use crate::execution::base::{generate_execution_id, Executor};
use crate::execution::contracts::{AlgoType, ExecutionAlgorithm, ExecutionIntent, FillEvent, OrderType};

/// One historical bar used to build the volume profile and benchmark.
#[derive(Debug, Clone, Copy)]
pub struct Bar {
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Splits `bars` into `slice_count` equal contiguous ranges and sums
/// volume per range, normalized to weights that sum to 1. Falls back to a
/// uniform profile when there's no usable volume.
pub fn compute_volume_profile(bars: &[Bar], slice_count: u32) -> Vec<f64> {
    let n = slice_count.max(1) as usize;
    if bars.is_empty() {
        return vec![1.0 / n as f64; n];
    }
    let chunk_size = (bars.len() + n - 1) / n;
    let mut sums = vec![0.0; n];
    for (i, chunk) in bars.chunks(chunk_size.max(1)).enumerate() {
        if i >= n {
            break;
        }
        sums[i] = chunk.iter().map(|b| b.volume).sum();
    }
    let total: f64 = sums.iter().sum();
    if total <= 0.0 {
        return vec![1.0 / n as f64; n];
    }
    sums.iter().map(|v| v / total).collect()
}

/// `Σ(typical_price · volume) / Σ volume` over the supplied bars.
pub fn compute_benchmark_vwap(bars: &[Bar]) -> Option<f64> {
    let total_volume: f64 = bars.iter().map(|b| b.volume).sum();
    if total_volume <= 0.0 {
        return None;
    }
    let weighted: f64 = bars.iter().map(|b| b.typical_price() * b.volume).sum();
    Some(weighted / total_volume)
}

pub struct VwapExecutor {
    pub slice_count: u32,
}

impl Default for VwapExecutor {
    fn default() -> Self {
        Self { slice_count: 10 }
    }
}

impl VwapExecutor {
    pub fn new(slice_count: u32) -> Self {
        Self { slice_count }
    }

    /// Plans against a concrete volume profile/benchmark instead of
    /// pulling them from a historical-data reader, keeping planning pure.
    pub fn plan_with_profile(
        &self,
        algo: &ExecutionAlgorithm,
        profile: &[f64],
        benchmark_vwap: Option<f64>,
    ) -> Result<Vec<ExecutionIntent>, String> {
        let limit_price = algo.limit_price()?;
        let execution_id = generate_execution_id(AlgoType::Vwap.prefix());
        let n = profile.len().max(1);
        let duration_ns = (algo.duration_seconds as i64) * 1_000_000_000;

        let mut intents = Vec::with_capacity(n);
        for (i, weight) in profile.iter().enumerate() {
            let ts = i as i64 * duration_ns / n as i64;
            let slice_id = format!("{execution_id}_slice_{i}");
            let mut meta = HashMap::new();
            meta.insert("execution_id".to_string(), json!(execution_id));
            meta.insert("slice_id".to_string(), json!(slice_id.clone()));
            meta.insert("algo_type".to_string(), json!(AlgoType::Vwap.as_str()));
            meta.insert("slice_idx".to_string(), json!(i));
            meta.insert("volume_weight".to_string(), json!(weight));
            if let Some(bench) = benchmark_vwap {
                meta.insert("benchmark_vwap".to_string(), json!(bench));
            }
            intents.push(ExecutionIntent {
                id: slice_id,
                ts_local_ns: ts,
                symbol: algo.symbol.clone(),
                side: algo.side,
                order_type: OrderType::Limit,
                qty: algo.total_quantity * weight,
                limit_price: Some(limit_price),
                meta,
            });
        }
        Ok(intents)
    }
}

impl Executor for VwapExecutor {
    fn algo_type(&self) -> AlgoType {
        AlgoType::Vwap
    }

    fn plan_execution(&self, algo: &ExecutionAlgorithm) -> Result<Vec<ExecutionIntent>, String> {
        let uniform = vec![1.0 / self.slice_count.max(1) as f64; self.slice_count.max(1) as usize];
        self.plan_with_profile(algo, &uniform, None)
    }
}

/// Adaptive re-plan: finds the first slice that isn't fully filled,
/// rebalances remaining weights if actual vs. expected progress has
/// diverged by more than 10%, and emits fresh intents for every slice
/// from that point forward, each tagged `meta.replanned = true`.
pub fn replan_remaining_slices(
    original: &[ExecutionIntent],
    fills: &[FillEvent],
    algo: &ExecutionAlgorithm,
) -> Result<Vec<ExecutionIntent>, String> {
    let limit_price = algo.limit_price()?;
    if original.is_empty() {
        return Ok(Vec::new());
    }
    let execution_id = original[0]
        .execution_id()
        .ok_or("original intents are missing execution_id")?
        .to_string();
    let benchmark_vwap = original[0]
        .meta
        .get("benchmark_vwap")
        .and_then(|v| v.as_f64());

    let mut filled_per_slice = vec![0.0; original.len()];
    for fill in fills {
        if let Some(idx) = fill.slice_idx() {
            if (idx as usize) < filled_per_slice.len() {
                filled_per_slice[idx as usize] += fill.qty;
            }
        }
    }

    let original_qty: Vec<f64> = original.iter().map(|i| i.qty).collect();
    let first_incomplete = original_qty
        .iter()
        .zip(filled_per_slice.iter())
        .position(|(q, f)| f < q)
        .unwrap_or(0);

    let total_filled: f64 = filled_per_slice.iter().sum();
    let elapsed_weight: f64 = original_qty[..first_incomplete].iter().sum::<f64>() / algo.total_quantity;
    let expected = elapsed_weight.max(f64::EPSILON);
    let actual = (total_filled / algo.total_quantity).max(0.0);
    let diverged = expected > 0.0 && ((actual - expected).abs() / expected) > 0.10;

    let remaining_original: Vec<f64> = original_qty[first_incomplete..].to_vec();
    let outstanding_qty: f64 = algo.total_quantity - total_filled;

    // Rebalancing and preserving both re-normalize the remaining slices'
    // original proportions over the outstanding quantity; `diverged` is
    // kept because it's the documented trigger, even though today's
    // renormalization formula is the same either way.
    let sum: f64 = remaining_original.iter().sum();
    let weights: Vec<f64> = if sum > 0.0 {
        remaining_original.iter().map(|q| q / sum).collect()
    } else {
        vec![1.0 / remaining_original.len().max(1) as f64; remaining_original.len()]
    };
    let _ = diverged;

    let duration_ns = (algo.duration_seconds as i64) * 1_000_000_000;
    let mut intents = Vec::with_capacity(weights.len());
    for (offset, weight) in weights.iter().enumerate() {
        let idx = first_incomplete + offset;
        let ts = idx as i64 * duration_ns / original.len() as i64;
        let slice_id = format!("{execution_id}_slice_{idx}_replan");
        let mut meta = HashMap::new();
        meta.insert("execution_id".to_string(), json!(execution_id));
        meta.insert("slice_id".to_string(), json!(slice_id.clone()));
        meta.insert("algo_type".to_string(), json!(AlgoType::Vwap.as_str()));
        meta.insert("slice_idx".to_string(), json!(idx));
        meta.insert("replanned".to_string(), json!(true));
        if let Some(bench) = benchmark_vwap {
            meta.insert("benchmark_vwap".to_string(), json!(bench));
        }
        intents.push(ExecutionIntent {
            id: slice_id,
            ts_local_ns: ts,
            symbol: algo.symbol.clone(),
            side: algo.side,
            order_type: OrderType::Limit,
            qty: outstanding_qty * weight,
            limit_price: Some(limit_price),
            meta,
        });
    }
    Ok(intents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::contracts::Side;
    use std::collections::HashMap as StdHashMap;

    fn algo(total_quantity: f64, duration_seconds: u64, limit_price: f64) -> ExecutionAlgorithm {
        let mut params = StdHashMap::new();
        params.insert("limit_price".to_string(), json!(limit_price));
        ExecutionAlgorithm::new(AlgoType::Vwap, "BTC/USDT", Side::Buy, total_quantity, duration_seconds, params)
            .unwrap()
    }

    #[test]
    fn empty_bars_fall_back_to_uniform_profile() {
        let profile = compute_volume_profile(&[], 5);
        assert_eq!(profile.len(), 5);
        assert!(profile.iter().all(|w| (*w - 0.2).abs() < 1e-9));
    }

    #[test]
    fn benchmark_vwap_is_volume_weighted_typical_price() {
        let bars = vec![
            Bar { high: 101.0, low: 99.0, close: 100.0, volume: 10.0 },
            Bar { high: 103.0, low: 101.0, close: 102.0, volume: 30.0 },
        ];
        let vwap = compute_benchmark_vwap(&bars).unwrap();
        let expected = (100.0 * 10.0 + 102.0 * 30.0) / 40.0;
        assert!((vwap - expected).abs() < 1e-9);
    }

    #[test]
    fn weights_sum_to_one_and_slices_match_weights() {
        let algo = algo(10.0, 300, 100.0);
        let executor = VwapExecutor::new(5);
        let profile = vec![0.2; 5];
        let intents = executor.plan_with_profile(&algo, &profile, None).unwrap();
        let total: f64 = intents.iter().map(|i| i.qty).sum();
        assert!((total - 10.0).abs() < 1e-9);
    }

    #[test]
    fn replan_redistributes_remaining_quantity() {
        let algo = algo(10.0, 300, 100.0);
        let executor = VwapExecutor::new(5);
        let profile = vec![0.2; 5];
        let original = executor.plan_with_profile(&algo, &profile, None).unwrap();

        let execution_id = original[0].execution_id().unwrap().to_string();
        let fills = vec![
            FillEvent {
                order_id: "a".into(),
                symbol: "BTC/USDT".into(),
                side: Side::Buy,
                qty: 0.5,
                price: 100.0,
                ts_fill_ns: 0,
                fee: 0.0,
                meta: [
                    ("execution_id".to_string(), json!(execution_id)),
                    ("slice_idx".to_string(), json!(0)),
                ]
                .into(),
            },
            FillEvent {
                order_id: "b".into(),
                symbol: "BTC/USDT".into(),
                side: Side::Buy,
                qty: 1.2,
                price: 100.0,
                ts_fill_ns: 0,
                fee: 0.0,
                meta: [
                    ("execution_id".to_string(), json!(original[0].execution_id().unwrap())),
                    ("slice_idx".to_string(), json!(1)),
                ]
                .into(),
            },
        ];

        let replanned = replan_remaining_slices(&original, &fills, &algo).unwrap();
        assert_eq!(replanned.len(), 5);
        let total: f64 = replanned.iter().map(|i| i.qty).sum();
        assert!((total - 8.3).abs() < 1e-6);
        assert!(replanned.iter().all(|i| i.meta["replanned"] == json!(true)));
    }
}
