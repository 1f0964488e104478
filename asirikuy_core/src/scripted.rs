// asirikuy_core/src/scripted.rs

//! Deterministic `NativeEngine` replaying a fixed action script keyed by bar index.
//! Records every call it receives so tests can inspect what the loop fed it.

use crate::native;
use crate::orders;

/// One scripted strategy decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptAction {
    /// Open an order. SL/TP are distances; `entry_price` is used by pending types.
    Open {
        order_type: orders::OrderType,
        lots: f64,
        entry_price: f64,
        sl: f64,
        tp: f64,
    },
    /// Close a ticket, or every order of the type with ticket -1.
    Close { order_type: orders::OrderType, ticket: i64 },
    /// Move SL/TP (distances) of a ticket.
    Modify {
        order_type: orders::OrderType,
        ticket: i64,
        sl: f64,
        tp: f64,
    },
    /// Return a non-zero code for this bar.
    Fail(i32),
}

impl ScriptAction {
    pub fn open_buy(lots: f64) -> Self {
        Self::Open { order_type: orders::OrderType::Buy, lots, entry_price: 0.0, sl: 0.0, tp: 0.0 }
    }

    pub fn open_sell(lots: f64) -> Self {
        Self::Open { order_type: orders::OrderType::Sell, lots, entry_price: 0.0, sl: 0.0, tp: 0.0 }
    }

    pub fn close_all(order_type: orders::OrderType) -> Self {
        Self::Close { order_type, ticket: -1 }
    }

    fn to_result(&self) -> Option<native::StrategyResult> {
        let (order_type, action, ticket, lots, entry, sl, tp) = match *self {
            Self::Open { order_type, lots, entry_price, sl, tp } => {
                (order_type, orders::SignalAction::Open, 0, lots, entry_price, sl, tp)
            }
            Self::Close { order_type, ticket } => (order_type, orders::SignalAction::Close, ticket, 0.0, 0.0, 0.0, 0.0),
            Self::Modify { order_type, ticket, sl, tp } => {
                (order_type, orders::SignalAction::Update, ticket, 0.0, 0.0, sl, tp)
            }
            Self::Fail(_) => return None,
        };
        Some(native::StrategyResult {
            ticket_number: ticket as f64,
            trading_signals: orders::signal_flag(order_type, action) as f64,
            lots,
            entry_price: entry,
            broker_sl: sl,
            broker_tp: tp,
            ..Default::default()
        })
    }
}

/// What the engine saw on one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub instance_id: i32,
    pub bar_index: usize,
    pub time: i64,
    pub balance: f64,
    pub open_orders: usize,
    /// Open time of the newest bar in each buffer.
    pub newest_bar_times: Vec<Option<i64>>,
}

pub struct ScriptedEngine {
    script: std::collections::HashMap<usize, Vec<ScriptAction>>,
    init_code: i32,
    wait_rounds: std::sync::atomic::AtomicUsize,
    inits: std::sync::Mutex<Vec<i32>>,
    deinits: std::sync::Mutex<Vec<i32>>,
    calls: std::sync::Mutex<Vec<CallRecord>>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            script: std::collections::HashMap::new(),
            init_code: 0,
            wait_rounds: std::sync::atomic::AtomicUsize::new(0),
            inits: std::sync::Mutex::new(Vec::new()),
            deinits: std::sync::Mutex::new(Vec::new()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Adds an action at a primary bar index. Several actions on one bar are emitted together.
    pub fn with_action(mut self, bar_index: usize, action: ScriptAction) -> Self {
        self.script.entry(bar_index).or_default().push(action);
        self
    }

    pub fn with_init_code(mut self, code: i32) -> Self {
        self.init_code = code;
        self
    }

    /// Answer `WAIT_FOR_INIT` this many times before the real init code.
    pub fn with_wait_for_init_rounds(self, rounds: usize) -> Self {
        self.wait_rounds.store(rounds, std::sync::atomic::Ordering::SeqCst);
        self
    }

    fn count(list: &std::sync::Mutex<Vec<i32>>, instance_id: i32) -> usize {
        list.lock()
            .map(|l| l.iter().filter(|id| **id == instance_id).count())
            .unwrap_or(0)
    }

    pub fn init_count(&self, instance_id: i32) -> usize {
        Self::count(&self.inits, instance_id)
    }

    pub fn deinit_count(&self, instance_id: i32) -> usize {
        Self::count(&self.deinits, instance_id)
    }

    pub fn call_count(&self, instance_id: i32) -> usize {
        self.calls().iter().filter(|c| c.instance_id == instance_id).count()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl native::NativeEngine for ScriptedEngine {
    fn init_instance(&self, instance_id: i32, _is_backtesting: bool, _config_path: &str, _account_label: &str) -> i32 {
        if let Ok(mut inits) = self.inits.lock() {
            inits.push(instance_id);
        }
        let waiting = self
            .wait_rounds
            .fetch_update(std::sync::atomic::Ordering::SeqCst, std::sync::atomic::Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok();
        if waiting {
            return crate::error::ReturnCode::WaitForInit as i32;
        }
        self.init_code
    }

    fn run_bar(&self, snapshot: &native::BarSnapshot<'_>) -> native::BarOutcome {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(CallRecord {
                instance_id: snapshot.instance_id,
                bar_index: snapshot.bar_index,
                time: snapshot.current_time,
                balance: snapshot.account_info[native::account_index::BALANCE],
                open_orders: snapshot.open_orders.len(),
                newest_bar_times: snapshot.buffers.iter().map(|b| b.bars.last().map(|r| r.time)).collect(),
            });
        }

        let Some(actions) = self.script.get(&snapshot.bar_index) else {
            return native::BarOutcome::success(Vec::new());
        };
        if let Some(code) = actions.iter().find_map(|a| match a {
            ScriptAction::Fail(code) => Some(*code),
            _ => None,
        }) {
            return native::BarOutcome::failure(code);
        }
        native::BarOutcome::success(actions.iter().filter_map(ScriptAction::to_result).collect())
    }

    fn deinit_instance(&self, instance_id: i32) {
        if let Ok(mut deinits) = self.deinits.lock() {
            deinits.push(instance_id);
        }
    }
}
