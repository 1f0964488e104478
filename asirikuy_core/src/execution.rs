// asirikuy_core/src/execution.rs

//! Per-Bar Execution Loop.
//! Drives one instance bar by bar: refresh buffers, settle the book against the
//! last closed bar, hand the engine one snapshot, apply what it returns.

use crate::context;
use crate::error::{BridgeError, BridgeResult};
use crate::instances;
use crate::native;
use crate::orders;
use crate::rates;
use crate::statistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NotStarted,
    Running,
    Finished,
    Aborted,
}

/// Everything needed to run one configured instance.
pub struct InstanceSetup {
    pub instance_id: i32,
    pub engine: std::sync::Arc<dyn native::NativeEngine>,
    pub engine_config: String,
    pub settings: [f64; native::SETTINGS_SIZE],
    pub account: crate::settings::AccountSettings,
    pub rates: rates::InstanceRates,
}

pub struct InstanceRunner {
    context: std::sync::Arc<context::RunContext>,
    instance_id: i32,
    engine: std::sync::Arc<dyn native::NativeEngine>,
    engine_config: String,
    settings: [f64; native::SETTINGS_SIZE],
    rates: rates::InstanceRates,
    book: orders::OrderBook,
    statistics: statistics::StatisticsAccumulator,
    state: LoopState,
    cursor: usize,
    bars_processed: usize,
    engine_calls: usize,
    /// Signals produced by the last completed step.
    step_signals: std::ops::Range<usize>,
    failure: Option<String>,
}

impl InstanceRunner {
    pub fn new(context: std::sync::Arc<context::RunContext>, setup: InstanceSetup) -> Self {
        let max_open_orders = setup.settings[native::settings_index::MAX_OPEN_ORDERS].max(1.0) as usize;
        let book = orders::OrderBook::new(
            setup.instance_id,
            setup.account,
            context.get_initial_balance(),
            max_open_orders,
        );
        let statistics =
            statistics::StatisticsAccumulator::new(context.get_initial_balance(), context.get_statistics().clone());

        Self {
            context,
            instance_id: setup.instance_id,
            engine: setup.engine,
            engine_config: setup.engine_config,
            settings: setup.settings,
            rates: setup.rates,
            book,
            statistics,
            state: LoopState::NotStarted,
            cursor: 0,
            bars_processed: 0,
            engine_calls: 0,
            step_signals: 0..0,
            failure: None,
        }
    }

    /// Initializes the instance in the engine and enters `Running`.
    /// A native init failure aborts this instance only.
    pub fn start(&mut self, registry: &instances::InstanceRegistry) -> BridgeResult<LoopState> {
        if self.state != LoopState::NotStarted {
            return Ok(self.state);
        }
        let is_backtesting = self.settings[native::settings_index::IS_BACKTESTING] != 0.0;
        match registry.init(
            self.engine.clone(),
            self.instance_id,
            is_backtesting,
            &self.engine_config,
            self.context.get_account_label(),
        ) {
            Ok(()) => {
                self.state = LoopState::Running;
                Ok(self.state)
            }
            Err(e) => self.abort(e),
        }
    }

    fn abort(&mut self, error: BridgeError) -> BridgeResult<LoopState> {
        tracing::error!("Instance {} aborted: {}", self.instance_id, error);
        self.failure = Some(error.to_string());
        self.state = LoopState::Aborted;
        if error.is_fatal_for_run() {
            return Err(error);
        }
        Ok(self.state)
    }

    /// Processes the next bar of the traded symbol.
    /// # Returns
    /// * The state after the step. Errors are returned only when they must end the whole run.
    pub fn step(&mut self, registry: &instances::InstanceRegistry) -> BridgeResult<LoopState> {
        self.step_signals = self.book.get_signals().len()..self.book.get_signals().len();
        if self.state != LoopState::Running {
            return Ok(self.state);
        }

        if self.context.get_stop_handle().is_stop_requested() {
            tracing::info!("Instance {} stopped at bar {}", self.instance_id, self.cursor);
            self.failure = Some("stop requested".to_string());
            self.state = LoopState::Aborted;
            return Ok(self.state);
        }

        let primary = self.rates.get_primary().clone();
        let Some(bar) = primary.get(self.cursor).copied() else {
            self.state = LoopState::Finished;
            return Ok(self.state);
        };
        let time = bar.time;
        let signals_before = self.book.get_signals().len();

        self.rates.advance_to(time);
        self.statistics.record_time(time);

        let spread = self.book.get_account().spread;
        let quote = orders::Quote {
            time,
            bid: bar.open,
            ask: bar.open + spread,
            conversion: self.rates.quote_conversion(time, bar.open),
            last_bar: self.cursor.checked_sub(1).and_then(|i| primary.get(i).copied()),
        };

        self.book.check_pending(&quote);
        self.book.check_stops(&quote);
        self.book.accrue_swap(time);

        // settlements stand even when the engine call below fails
        let settled = self.book.get_signals().len();
        self.statistics.record_signals(&self.book.get_signals()[signals_before..settled]);
        self.step_signals = signals_before..settled;

        if self.context.in_window(time) && self.rates.is_warmed_up() {
            let outcome = {
                let snapshot = self.snapshot(&quote, &bar);
                registry.invoke(&snapshot)
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => return self.abort(e),
            };
            self.engine_calls += 1;

            if outcome.code != crate::error::ReturnCode::Success as i32 {
                return self.abort(BridgeError::NativeCallFailed {
                    instance_id: self.instance_id,
                    bar: self.cursor,
                    code: outcome.code,
                });
            }
            if let Err(e) = self.book.apply_results(&outcome.results, &quote) {
                return self.abort(e);
            }
        }

        if let Err(e) = self.book.check_ledger() {
            return self.abort(e);
        }

        let signals_after = self.book.get_signals().len();
        self.statistics.record_signals(&self.book.get_signals()[settled..signals_after]);
        self.step_signals = signals_before..signals_after;
        self.bars_processed += 1;
        self.cursor += 1;

        if self.book.get_balance() <= 0.0 {
            tracing::warn!("Instance {}: balance exhausted at {}, run stopped", self.instance_id, time);
            self.state = LoopState::Finished;
        } else if self.cursor >= primary.len() {
            self.state = LoopState::Finished;
        }
        Ok(self.state)
    }

    fn snapshot<'a>(&'a self, quote: &orders::Quote, bar: &rates::Rate) -> native::BarSnapshot<'a> {
        use native::account_index as acc;
        use native::bid_ask_index as ba;

        let account = self.book.get_account();
        let balance = self.book.get_balance();
        let mut account_info = [0.0; native::ACCOUNT_INFO_SIZE];
        account_info[acc::ACCOUNT_NUMBER] = self.instance_id as f64;
        account_info[acc::BALANCE] = balance;
        account_info[acc::EQUITY] = self.book.equity(quote);
        account_info[acc::MARGIN] = self.book.margin();
        account_info[acc::LEVERAGE] = account.leverage;
        account_info[acc::CONTRACT_SIZE] = account.contract_size;
        account_info[acc::MINIMUM_STOP] = account.minimum_stop;
        account_info[acc::STOPOUT_PERCENT] = account.stop_out_percent;

        let base_conversion = self.rates.base_conversion(quote.time, bar.open);
        let mut bid_ask = [0.0; native::BID_ASK_SIZE];
        bid_ask[ba::BID] = quote.bid;
        bid_ask[ba::ASK] = quote.ask;
        bid_ask[ba::BASE_CONVERSION_BID] = base_conversion;
        bid_ask[ba::BASE_CONVERSION_ASK] = base_conversion;
        bid_ask[ba::QUOTE_CONVERSION_BID] = quote.conversion;
        bid_ask[ba::QUOTE_CONVERSION_ASK] = quote.conversion;

        native::BarSnapshot {
            instance_id: self.instance_id,
            bar_index: self.cursor,
            current_time: quote.time,
            settings: &self.settings,
            symbol: self.rates.get_symbol(),
            account_currency: self.context.get_account_currency(),
            broker_name: self.context.get_broker_name(),
            ref_broker_name: self.context.get_ref_broker_name(),
            account_info,
            bid_ask,
            open_orders: self.book.open_orders_c(),
            buffers: self.rates.views(),
        }
    }

    /// Runs the instance to completion and releases it in the registry.
    pub fn run(&mut self, registry: &instances::InstanceRegistry) -> BridgeResult<statistics::TestResult> {
        let span = self.context.get_span().clone();
        let _enter = span.enter();

        let outcome = self.run_loop(registry);
        registry.deinit(self.instance_id);
        outcome?;
        Ok(self.result())
    }

    fn run_loop(&mut self, registry: &instances::InstanceRegistry) -> BridgeResult<()> {
        self.start(registry)?;
        while self.step(registry)? == LoopState::Running {}
        Ok(())
    }

    /// Statistics over the bars processed so far.
    pub fn result(&self) -> statistics::TestResult {
        let mut result = self.statistics.finish(
            self.rates.get_symbol(),
            self.book.get_counters(),
            self.book.avg_trade_duration(),
            self.bars_processed,
        );
        result.failure = self.failure.clone();
        result
    }

    // Getters

    pub fn get_instance_id(&self) -> i32 {
        self.instance_id
    }

    pub fn get_state(&self) -> LoopState {
        self.state
    }

    pub fn get_book(&self) -> &orders::OrderBook {
        &self.book
    }

    pub fn get_statistics(&self) -> &statistics::StatisticsAccumulator {
        &self.statistics
    }

    pub fn get_failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn get_bars_processed(&self) -> usize {
        self.bars_processed
    }

    pub fn get_engine_calls(&self) -> usize {
        self.engine_calls
    }

    /// Open time of the next bar to process.
    pub fn next_bar_time(&self) -> Option<i64> {
        self.rates.get_primary().get(self.cursor).map(|r| r.time)
    }

    /// Signals appended by the last completed step.
    pub fn last_step_signals(&self) -> &[orders::TradeSignal] {
        &self.book.get_signals()[self.step_signals.clone()]
    }
}

/// Evaluates optimization candidates of one system. Each candidate runs on a
/// fresh copy of the system's buffers under its own instance id
/// (see [`candidate_id`]), so concurrent workers never share an id.
pub struct SystemCandidateRunner {
    context: std::sync::Arc<context::RunContext>,
    template: InstanceSetup,
}

impl SystemCandidateRunner {
    pub fn new(context: &context::RunContext, template: InstanceSetup) -> Self {
        // candidates stop between runs, never mid-run
        let context = context.clone().with_stop_handle(context::StopHandle::new());
        Self {
            context: std::sync::Arc::new(context),
            template,
        }
    }

    pub fn candidate_id(&self, worker: usize) -> BridgeResult<i32> {
        candidate_id(self.template.instance_id, worker)
    }
}

/// Workers per system in the candidate id space.
pub const CANDIDATE_ID_STRIDE: usize = 1000;

/// Instance id of a candidate run by `worker` for system `base_id`.
/// Fails when the worker exceeds the stride or the id leaves the `i32` range.
pub fn candidate_id(base_id: i32, worker: usize) -> BridgeResult<i32> {
    let out_of_range = || {
        BridgeError::Config(format!(
            "instance {} cannot hold candidate ids for worker {}",
            base_id, worker
        ))
    };
    if worker >= CANDIDATE_ID_STRIDE {
        return Err(out_of_range());
    }
    base_id
        .checked_mul(CANDIDATE_ID_STRIDE as i32)
        // negative bases count away from zero so id ranges stay disjoint
        .and_then(|id| if id < 0 { id.checked_sub(worker as i32) } else { id.checked_add(worker as i32) })
        .ok_or_else(out_of_range)
}

impl crate::optimization::CandidateRunner for SystemCandidateRunner {
    fn evaluate(
        &self,
        parameters: &crate::optimization::ParameterSet,
        worker: usize,
    ) -> BridgeResult<statistics::TestResult> {
        let mut settings = self.template.settings;
        parameters.apply_to(&mut settings);
        let instance_id = self.candidate_id(worker)?;
        settings[native::settings_index::STRATEGY_INSTANCE_ID] = instance_id as f64;

        let setup = InstanceSetup {
            instance_id,
            engine: self.template.engine.clone(),
            engine_config: self.template.engine_config.clone(),
            settings,
            account: self.template.account.clone(),
            rates: self.template.rates.clone(),
        };
        let registry = instances::InstanceRegistry::new();
        InstanceRunner::new(self.context.clone(), setup).run(&registry)
    }
}
