// asirikuy_tester/src/runner.rs

//! Wires a loaded configuration into either a portfolio test or an
//! optimization per system, and writes the reports.

use anyhow::Context;

use asirikuy_core::{context, engine_loader, execution, native, optimization, portfolio, rates, report, settings};

pub struct TestRunner {
    settings: settings::Settings,
    context: std::sync::Arc<context::RunContext>,
    manager: rates::RateBufferManager,
    engines: std::collections::HashMap<String, std::sync::Arc<dyn native::NativeEngine>>,
}

impl TestRunner {
    /// Validates the run context and loads every history the systems need.
    pub fn new(settings: settings::Settings) -> anyhow::Result<Self> {
        let context = context::RunContext::from_settings(&settings)?;
        let mut manager = rates::RateBufferManager::new(context.get_history_path(), context.get_base_timeframe());

        let mut symbols: Vec<String> = Vec::new();
        for system in &settings.systems {
            symbols.push(system.symbol.clone());
            for requirement in &system.rate_requirements {
                if requirement.symbol != rates::SAME_AS_TRADED {
                    symbols.push(requirement.symbol.clone());
                }
            }
        }
        manager
            .load_symbols(&symbols)
            .with_context(|| format!("Failed to load history from {}", context.get_history_path().display()))?;
        let conversions = manager.load_conversion_symbols(&context.traded_symbols(), context.get_account_currency())?;
        tracing::info!("Loaded {} conversion series", conversions);

        anyhow::Ok(Self {
            settings,
            context: std::sync::Arc::new(context),
            manager,
            engines: std::collections::HashMap::new(),
        })
    }

    fn engine_for(&mut self, path: &str) -> anyhow::Result<std::sync::Arc<dyn native::NativeEngine>> {
        if let Some(engine) = self.engines.get(path) {
            return anyhow::Ok(engine.clone());
        }
        let engine: std::sync::Arc<dyn native::NativeEngine> = std::sync::Arc::new(
            engine_loader::LibraryEngine::load_from_path(path)
                .with_context(|| format!("Failed to load strategy framework {}", path))?,
        );
        self.engines.insert(path.to_string(), engine.clone());
        anyhow::Ok(engine)
    }

    fn setups(&mut self) -> anyhow::Result<Vec<execution::InstanceSetup>> {
        let systems = self.settings.systems.clone();
        let mut setups = Vec::with_capacity(systems.len());
        for system in &systems {
            let engine = self.engine_for(&system.engine_path)?;
            setups.push(portfolio::instance_setup(system, &self.settings.common, &self.manager, engine)?);
        }
        anyhow::Ok(setups)
    }

    fn exit_dir(&self) -> anyhow::Result<std::path::PathBuf> {
        let dir = self.context.get_exit_results_path().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        anyhow::Ok(dir)
    }

    pub fn get_stop_handle(&self) -> &context::StopHandle {
        self.context.get_stop_handle()
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        if self.settings.is_optimization() {
            self.run_optimizations()
        } else {
            self.run_portfolio()
        }
    }

    fn run_portfolio(&mut self) -> anyhow::Result<()> {
        let setups = self.setups()?;
        let mut coordinator = portfolio::PortfolioCoordinator::new(self.context.clone());
        for setup in setups {
            coordinator.add_instance(setup)?;
        }
        let result = coordinator.run()?;

        let dir = self.exit_dir()?;
        let trades: Vec<report::TradeRecord> =
            result.instances.iter().flat_map(|i| i.trades.iter().cloned()).collect();
        report::write_trades_csv(dir.join("trades.csv"), &trades)?;
        report::export_balance_to_csv(dir.join("balance.csv"), &result.combined_curve)?;
        report::write_result_json(dir.join("results.json"), &result.combined)?;
        for instance in &result.instances {
            report::export_balance_to_csv(
                dir.join(format!("balance_{}.csv", instance.instance_id)),
                &instance.balance_curve,
            )?;
            report::write_result_json(dir.join(format!("results_{}.json", instance.instance_id)), &instance.result)?;
        }

        for (name, value) in result.combined.to_stats_list() {
            println!("{:<24}{}", name, value);
        }
        let failed = result.failed_instances();
        if !failed.is_empty() {
            tracing::warn!("Instances ended early: {:?}", failed);
        }
        anyhow::Ok(())
    }

    fn run_optimizations(&mut self) -> anyhow::Result<()> {
        let Some(optimization_settings) = self.settings.optimization.clone() else {
            anyhow::bail!("Mode 'Optimize' needs an 'optimization' section");
        };
        let setups = self.setups()?;
        let dir = self.exit_dir()?;
        let pool = optimization::LocalPool::new(self.context.get_threads());

        for setup in setups {
            let instance_id = setup.instance_id;
            let writer = report::OptimizationWriter::create(dir.join(format!("optimization_{}.csv", instance_id)))?;
            let sink = optimization::OptimizationSink::new(optimization_settings.optimization_goal).with_writer(writer);
            let candidates = execution::SystemCandidateRunner::new(&self.context, setup);

            tracing::info!("Optimizing instance {} on {} threads", instance_id, pool.get_threads());
            let summary = optimization::run_optimization(
                &optimization_settings,
                &candidates,
                &pool,
                &sink,
                self.context.get_stop_handle(),
            )?;

            match summary.best(optimization_settings.optimization_goal) {
                Some(best) => tracing::info!(
                    "Instance {} best {} -> {:?} {:.4}",
                    instance_id,
                    best.get_parameters().format_for_display(),
                    optimization_settings.optimization_goal,
                    best.get_fitness()
                ),
                None => tracing::warn!("Instance {}: no successful evaluation", instance_id),
            }
        }
        anyhow::Ok(())
    }
}

/// Routes Ctrl-C to `stop`. Runs end at the next bar or candidate boundary.
pub fn install_interrupt_handler(stop: &context::StopHandle) {
    if let Err(e) = ctrlc::set_handler(interrupt_callback(stop.clone())) {
        tracing::warn!("Failed to set Ctrl-C handler: {}. Runs cannot be interrupted.", e);
    }
}

fn interrupt_callback(stop: context::StopHandle) -> impl Fn() + Send + 'static {
    move || {
        tracing::warn!("Received Ctrl-C, stopping after the current bar");
        stop.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_reaches_shared_context() {
        let context = std::sync::Arc::new(context::RunContext::new(10_000.0, "USD", 1));
        let callback = interrupt_callback(context.get_stop_handle().clone());
        assert!(!context.get_stop_handle().is_stop_requested());

        callback();
        assert!(context.get_stop_handle().is_stop_requested());

        let mut coordinator = portfolio::PortfolioCoordinator::new(context.clone());
        let engine = std::sync::Arc::new(asirikuy_core::scripted::ScriptedEngine::new());
        let mut manager = rates::RateBufferManager::new(".", 1);
        let bars = (0..20)
            .map(|i| rates::Rate {
                time: 1_600_000_000 + i * 60,
                open: 1.1,
                high: 1.1,
                low: 1.1,
                close: 1.1,
                ..Default::default()
            })
            .collect();
        manager.insert_history("EURUSD", bars).unwrap();
        let requirements = vec![rates::RateRequirement {
            symbol: rates::SAME_AS_TRADED.to_string(),
            timeframe: 0,
            bars: 1,
        }];
        let mut vector = [0.0; native::SETTINGS_SIZE];
        vector[native::settings_index::MAX_OPEN_ORDERS] = 1.0;
        coordinator
            .add_instance(execution::InstanceSetup {
                instance_id: 1,
                engine: engine.clone(),
                engine_config: String::new(),
                settings: vector,
                account: settings::AccountSettings::default(),
                rates: manager.build_instance_rates("EURUSD", 1, &requirements, 5, "USD").unwrap(),
            })
            .unwrap();

        let result = coordinator.run().unwrap();
        assert_eq!(engine.call_count(1), 0);
        assert_eq!(result.failed_instances(), vec![1]);
    }
}
