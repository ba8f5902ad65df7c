//! Fill-price slippage models applied by the backtest simulator.

#[derive(Debug, Clone, Copy)]
pub enum SlippageModel {
    /// `coefficient · (order_size / market_volume) · reference_price + spread / 2`
    Linear { coefficient: f64 },
    /// `coefficient · sqrt(order_size / market_volume) · reference_price + spread / 2`
    SquareRoot { coefficient: f64 },
}

impl SlippageModel {
    /// Returns the absolute price impact (always non-negative); the caller
    /// adds it for buys and subtracts it for sells.
    pub fn impact(
        &self,
        order_size: f64,
        market_volume: f64,
        spread: f64,
        reference_price: f64,
    ) -> Result<f64, String> {
        if order_size < 0.0 {
            return Err(format!("order_size must be >= 0, got {order_size}"));
        }
        if market_volume <= 0.0 {
            return Err(format!("market_volume must be > 0, got {market_volume}"));
        }
        if spread < 0.0 {
            return Err(format!("spread must be >= 0, got {spread}"));
        }
        if reference_price <= 0.0 {
            return Err(format!("reference_price must be > 0, got {reference_price}"));
        }

        let participation = order_size / market_volume;
        let market_impact = match self {
            SlippageModel::Linear { coefficient } => coefficient * participation * reference_price,
            SlippageModel::SquareRoot { coefficient } => {
                coefficient * participation.sqrt() * reference_price
            }
        };
        Ok(market_impact + spread / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_impact_scales_with_participation() {
        let model = SlippageModel::Linear { coefficient: 0.1 };
        let impact = model.impact(10.0, 100.0, 0.0, 100.0).unwrap();
        assert!((impact - 1.0).abs() < 1e-9); // 0.1 * 0.1 * 100
    }

    #[test]
    fn square_root_impact_grows_slower_than_linear_for_large_orders() {
        let linear = SlippageModel::Linear { coefficient: 0.1 };
        let sqrt = SlippageModel::SquareRoot { coefficient: 0.1 };
        let linear_impact = linear.impact(50.0, 100.0, 0.0, 100.0).unwrap();
        let sqrt_impact = sqrt.impact(50.0, 100.0, 0.0, 100.0).unwrap();
        assert!(sqrt_impact < linear_impact);
    }

    #[test]
    fn spread_contributes_half_regardless_of_model() {
        let model = SlippageModel::Linear { coefficient: 0.0 };
        let impact = model.impact(10.0, 100.0, 2.0, 100.0).unwrap();
        assert!((impact - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_non_positive_market_volume_and_reference_price() {
        let model = SlippageModel::Linear { coefficient: 0.1 };
        assert!(model.impact(1.0, 0.0, 0.0, 100.0).is_err());
        assert!(model.impact(1.0, 100.0, 0.0, 0.0).is_err());
        assert!(model.impact(-1.0, 100.0, 0.0, 100.0).is_err());
    }
}
