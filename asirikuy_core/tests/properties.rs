// asirikuy_core/tests/properties.rs

use asirikuy_core::{orders, rates, settings, statistics};
use proptest::prelude::*;

fn series_from_gaps(gaps: &[i64]) -> Vec<rates::Rate> {
    let mut time = 1_600_000_020;
    gaps.iter()
        .enumerate()
        .map(|(i, gap)| {
            time += gap * 60;
            let price = 1.0 + (i % 7) as f64 * 0.001;
            rates::Rate {
                time,
                open: price,
                high: price + 0.0005,
                low: price - 0.0005,
                close: price,
                volume: 1.0,
                ..Default::default()
            }
        })
        .collect()
}

proptest! {
    #[test]
    fn test_refactor_keeps_time_order(
        gaps in prop::collection::vec(1i64..10, 1..300),
        target in prop::sample::select(vec![5u32, 15, 60, 240]),
    ) {
        let base = series_from_gaps(&gaps);
        let bars = rates::refactor(&base, 1, target).unwrap();

        prop_assert!(!bars.is_empty());
        prop_assert!(bars.len() <= base.len());
        prop_assert!(bars.windows(2).all(|w| w[0].time < w[1].time));
        prop_assert!(bars.iter().all(|b| b.time % (target as i64 * 60) == 0));
        let volume: f64 = bars.iter().map(|b| b.volume).sum();
        prop_assert!((volume - base.len() as f64).abs() < 1e-9);
    }

    #[test]
    fn test_coherent_series_share_timestamps(
        first in prop::collection::vec(1i64..4, 1..200),
        second in prop::collection::vec(1i64..4, 1..200),
    ) {
        let coherent = rates::make_coherent(&[series_from_gaps(&first), series_from_gaps(&second)]);
        prop_assert_eq!(coherent[0].len(), coherent[1].len());
        prop_assert!(coherent[0].iter().zip(&coherent[1]).all(|(a, b)| a.time == b.time));
    }

    #[test]
    fn test_metrics_stay_in_range(
        profits in prop::collection::vec(-400.0f64..400.0, 0..120),
        compounding in any::<bool>(),
    ) {
        let options = settings::StatisticsSettings {
            disable_compounding: !compounding,
            include_costs_in_metrics: true,
        };
        let mut accumulator = statistics::StatisticsAccumulator::new(100_000.0, options);
        accumulator.record_time(1_600_000_000);
        for (i, profit) in profits.iter().enumerate() {
            accumulator.record_close(1_600_000_000 + (i as i64 + 1) * 86_400, *profit, *profit);
        }
        let result = accumulator.finish("EURUSD", orders::TradeCounters::default(), 0.0, profits.len());

        prop_assert!(result.profit_factor.is_finite() && result.profit_factor >= 0.0);
        prop_assert!((0.0..=1.0).contains(&result.r2));
        prop_assert!(result.sharpe.is_finite());
        prop_assert!((0.0..=100.0).contains(&result.max_dd_percent));
        prop_assert!(result.max_dd_depth >= 0.0);
        let expected = 100_000.0 + profits.iter().sum::<f64>();
        prop_assert!((result.final_balance - expected).abs() < 1e-6);
    }
}
