// asirikuy_core/src/portfolio.rs

//! Portfolio Coordinator.
//! Steps every instance of a run on the same bar timestamps and folds their
//! realized profit into one combined balance curve, keeping each instance's
//! own curve and trades for per-system reporting.

use crate::context;
use crate::error::{BridgeError, BridgeResult};
use crate::execution;
use crate::instances;
use crate::native;
use crate::rates;
use crate::report;
use crate::settings;
use crate::statistics;

/// Outcome of one instance inside a portfolio run.
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub instance_id: i32,
    pub symbol: String,
    pub result: statistics::TestResult,
    pub balance_curve: Vec<statistics::BalancePoint>,
    pub trades: Vec<report::TradeRecord>,
}

#[derive(Debug, Clone)]
pub struct PortfolioResult {
    pub combined: statistics::TestResult,
    pub combined_curve: Vec<statistics::BalancePoint>,
    pub instances: Vec<InstanceReport>,
}

impl PortfolioResult {
    /// Instances that ended on an error or a stop request.
    pub fn failed_instances(&self) -> Vec<i32> {
        self.instances
            .iter()
            .filter(|i| i.result.failure.is_some())
            .map(|i| i.instance_id)
            .collect()
    }
}

/// Builds the setup of one configured system against loaded histories.
/// # Arguments
/// * `system` - Instance configuration.
/// * `common` - Run-wide settings.
/// * `manager` - Loaded and coherence-passed histories.
/// * `engine` - Native engine serving the instance.
pub fn instance_setup(
    system: &settings::SystemSettings,
    common: &settings::CommonSettings,
    manager: &rates::RateBufferManager,
    engine: std::sync::Arc<dyn native::NativeEngine>,
) -> BridgeResult<execution::InstanceSetup> {
    let rates = manager.build_instance_rates(
        &system.symbol,
        system.strategy_timeframe,
        &system.rate_requirements,
        system.account.digits,
        &common.account_currency,
    )?;
    Ok(execution::InstanceSetup {
        instance_id: system.instance_id,
        engine,
        engine_config: system.engine_config.clone(),
        settings: system.settings_vector(common)?,
        account: system.account.clone(),
        rates,
    })
}

pub struct PortfolioCoordinator {
    context: std::sync::Arc<context::RunContext>,
    registry: instances::InstanceRegistry,
    runners: Vec<execution::InstanceRunner>,
}

impl PortfolioCoordinator {
    pub fn new(context: std::sync::Arc<context::RunContext>) -> Self {
        Self {
            context,
            registry: instances::InstanceRegistry::new(),
            runners: Vec::new(),
        }
    }

    pub fn with_registry(mut self, registry: instances::InstanceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn add_instance(&mut self, setup: execution::InstanceSetup) -> BridgeResult<()> {
        if self.runners.iter().any(|r| r.get_instance_id() == setup.instance_id) {
            return Err(BridgeError::DuplicateInstance(setup.instance_id));
        }
        self.runners.push(execution::InstanceRunner::new(self.context.clone(), setup));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Runs every instance to completion in lockstep.
    /// A native failure ends only its own instance; config and invariant errors end the run.
    pub fn run(&mut self) -> BridgeResult<PortfolioResult> {
        let span = self.context.get_span().clone();
        let _enter = span.enter();

        let outcome = self.run_lockstep();
        self.registry.deinit_all();
        let combined = outcome?;
        Ok(self.collect(combined))
    }

    fn run_lockstep(&mut self) -> BridgeResult<statistics::StatisticsAccumulator> {
        let mut combined = statistics::StatisticsAccumulator::new(
            self.context.get_initial_balance(),
            self.context.get_statistics().clone(),
        );

        for runner in &mut self.runners {
            runner.start(&self.registry)?;
        }
        tracing::info!("Portfolio run with {} instances", self.runners.len());

        loop {
            let next_time = self
                .runners
                .iter()
                .filter(|r| r.get_state() == execution::LoopState::Running)
                .filter_map(execution::InstanceRunner::next_bar_time)
                .min();
            let Some(time) = next_time else {
                break;
            };

            combined.record_time(time);
            for runner in &mut self.runners {
                if runner.get_state() != execution::LoopState::Running || runner.next_bar_time() != Some(time) {
                    continue;
                }
                runner.step(&self.registry)?;
                combined.record_signals(runner.last_step_signals());
            }
        }

        // instances with an empty series never got a bar
        for runner in &mut self.runners {
            if runner.get_state() == execution::LoopState::Running {
                runner.step(&self.registry)?;
            }
        }

        Ok(combined)
    }

    fn collect(&self, combined: statistics::StatisticsAccumulator) -> PortfolioResult {
        let instances: Vec<InstanceReport> = self
            .runners
            .iter()
            .map(|runner| {
                let result = runner.result();
                InstanceReport {
                    instance_id: runner.get_instance_id(),
                    symbol: result.symbol.clone(),
                    balance_curve: runner.get_statistics().balance_curve(),
                    trades: report::trade_records(
                        &result.symbol,
                        self.context.get_initial_balance(),
                        runner.get_book().get_closed_orders(),
                    ),
                    result,
                }
            })
            .collect();

        let mut counters = crate::orders::TradeCounters::default();
        let mut duration_sum = 0.0;
        let mut closes = 0usize;
        for runner in &self.runners {
            let c = runner.get_book().get_counters();
            counters.total_trades += c.total_trades;
            counters.num_longs += c.num_longs;
            counters.num_shorts += c.num_shorts;
            let n = runner.get_book().get_closed_orders().len();
            duration_sum += runner.get_book().avg_trade_duration() * n as f64;
            closes += n;
        }
        let avg_duration = if closes > 0 { duration_sum / closes as f64 } else { 0.0 };
        let bars = self.runners.iter().map(|r| r.get_bars_processed()).max().unwrap_or(0);

        let label = instances.iter().map(|i| i.symbol.as_str()).collect::<Vec<_>>().join(",");
        let mut result = combined.finish(&label, counters, avg_duration, bars);
        let failed: Vec<String> = instances
            .iter()
            .filter_map(|i| i.result.failure.as_ref().map(|f| format!("{}: {}", i.instance_id, f)))
            .collect();
        if !failed.is_empty() {
            result.failure = Some(failed.join("; "));
        }

        PortfolioResult {
            combined: result,
            combined_curve: combined.balance_curve(),
            instances,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders;
    use crate::scripted::{ScriptAction, ScriptedEngine};

    fn series(count: usize, step: f64) -> Vec<rates::Rate> {
        (0..count)
            .map(|i| {
                let price = 1.0 + i as f64 * step;
                rates::Rate {
                    time: 1_600_000_000 + i as i64 * 60,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    ..Default::default()
                }
            })
            .collect()
    }

    fn setup(
        manager: &rates::RateBufferManager,
        id: i32,
        symbol: &str,
        engine: std::sync::Arc<ScriptedEngine>,
    ) -> execution::InstanceSetup {
        let requirements = vec![rates::RateRequirement {
            symbol: rates::SAME_AS_TRADED.to_string(),
            timeframe: 0,
            bars: 1,
        }];
        let mut settings = [0.0; native::SETTINGS_SIZE];
        settings[native::settings_index::MAX_OPEN_ORDERS] = 1.0;
        execution::InstanceSetup {
            instance_id: id,
            engine,
            engine_config: String::new(),
            settings,
            account: settings::AccountSettings::default(),
            rates: manager.build_instance_rates(symbol, 1, &requirements, 5, "USD").unwrap(),
        }
    }

    fn manager() -> rates::RateBufferManager {
        let mut manager = rates::RateBufferManager::new(".", 1);
        manager.insert_history("EURUSD", series(20, 0.0001)).unwrap();
        manager.insert_history("GBPUSD", series(20, -0.0001)).unwrap();
        manager.make_loaded_coherent();
        manager
    }

    #[test]
    fn test_combined_curve_sums_realized_profit() {
        let manager = manager();
        let long = std::sync::Arc::new(
            ScriptedEngine::new()
                .with_action(2, ScriptAction::open_buy(1.0))
                .with_action(12, ScriptAction::close_all(orders::OrderType::Buy)),
        );
        let short = std::sync::Arc::new(
            ScriptedEngine::new()
                .with_action(4, ScriptAction::open_sell(1.0))
                .with_action(9, ScriptAction::close_all(orders::OrderType::Sell)),
        );

        let context = std::sync::Arc::new(context::RunContext::new(10_000.0, "USD", 1));
        let mut portfolio = PortfolioCoordinator::new(context);
        portfolio.add_instance(setup(&manager, 1, "EURUSD", long)).unwrap();
        portfolio.add_instance(setup(&manager, 2, "GBPUSD", short)).unwrap();
        let result = portfolio.run().unwrap();

        // +10 pips long, +5 pips short on a falling series
        let first = result.instances[0].result.final_balance - 10_000.0;
        let second = result.instances[1].result.final_balance - 10_000.0;
        assert!((first - 100.0).abs() < 1e-6);
        assert!((second - 50.0).abs() < 1e-6);
        assert!((result.combined.final_balance - 10_150.0).abs() < 1e-6);
        assert_eq!(result.combined.total_trades, 2);
        assert_eq!(result.instances[0].trades.len(), 1);
        assert_eq!(result.combined_curve.len(), 4);
        assert!(result.failed_instances().is_empty());
    }

    #[test]
    fn test_failed_instance_does_not_stop_others() {
        let manager = manager();
        let failing = std::sync::Arc::new(ScriptedEngine::new().with_action(3, ScriptAction::Fail(3017)));
        let healthy = std::sync::Arc::new(ScriptedEngine::new());

        let context = std::sync::Arc::new(context::RunContext::new(10_000.0, "USD", 1));
        let mut portfolio = PortfolioCoordinator::new(context);
        portfolio.add_instance(setup(&manager, 1, "EURUSD", failing.clone())).unwrap();
        portfolio.add_instance(setup(&manager, 2, "GBPUSD", healthy.clone())).unwrap();
        let result = portfolio.run().unwrap();

        assert_eq!(result.failed_instances(), vec![1]);
        assert_eq!(result.instances[0].result.bars_processed, 3);
        assert_eq!(result.instances[1].result.bars_processed, 20);
        assert_eq!(healthy.call_count(2), 19);
        assert_eq!(failing.deinit_count(1), 1);
        assert!(result.combined.failure.unwrap().starts_with("1:"));
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let manager = manager();
        let engine = std::sync::Arc::new(ScriptedEngine::new());
        let mut portfolio = PortfolioCoordinator::new(std::sync::Arc::new(context::RunContext::new(1.0, "USD", 1)));
        portfolio.add_instance(setup(&manager, 1, "EURUSD", engine.clone())).unwrap();
        assert!(matches!(
            portfolio.add_instance(setup(&manager, 1, "GBPUSD", engine)),
            Err(BridgeError::DuplicateInstance(1))
        ));
    }
}
