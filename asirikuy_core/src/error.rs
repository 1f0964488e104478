// asirikuy_core/src/error.rs

//! Error taxonomy of the bridge.
//! Config errors abort the whole run before any bar is simulated, native errors abort one
//! instance, data errors abort instance construction, invariant errors are always fatal.

use thiserror::Error;

/// Return codes of the native framework (`AsirikuyReturnCode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReturnCode {
    Success = 0,
    InvalidCurrency = 3000,
    UnknownSymbol = 3001,
    SymbolTooShort = 3002,
    ParseSymbolFailed = 3003,
    NoConversionSymbols = 3004,
    NullPointer = 3005,
    InvalidStrategyId = 3006,
    NotEnoughMargin = 3007,
    SpreadTooWide = 3008,
    NotEnoughRatesData = 3009,
    WorstCaseScenario = 3010,
    NormalizeBarsFailed = 3011,
    InitLoggingFailed = 3012,
    DeinitLoggingFailed = 3013,
    ContextCreationFailed = 3014,
    UnknownTimezone = 3015,
    InvalidTimeOffset = 3016,
    InvalidParameter = 3017,
    NnTrainingFailed = 3018,
    UnableToLoadFile = 3019,
    TooManyInstances = 3022,
    InvalidConfig = 3023,
    MissingConfig = 3024,
    InitXmlFailed = 3025,
    UnknownInstanceId = 3026,
    InsufficientMemory = 3027,
    WaitForInit = 3028,
    ErrorInRatesRetrieval = 3029,
    BidAskIsZero = 3030,
    FileWritingError = 3031,
}

impl ReturnCode {
    /// Maps a raw integer coming back over the C boundary.
    pub fn from_raw(code: i32) -> Option<Self> {
        let known = [
            Self::Success,
            Self::InvalidCurrency,
            Self::UnknownSymbol,
            Self::SymbolTooShort,
            Self::ParseSymbolFailed,
            Self::NoConversionSymbols,
            Self::NullPointer,
            Self::InvalidStrategyId,
            Self::NotEnoughMargin,
            Self::SpreadTooWide,
            Self::NotEnoughRatesData,
            Self::WorstCaseScenario,
            Self::NormalizeBarsFailed,
            Self::InitLoggingFailed,
            Self::DeinitLoggingFailed,
            Self::ContextCreationFailed,
            Self::UnknownTimezone,
            Self::InvalidTimeOffset,
            Self::InvalidParameter,
            Self::NnTrainingFailed,
            Self::UnableToLoadFile,
            Self::TooManyInstances,
            Self::InvalidConfig,
            Self::MissingConfig,
            Self::InitXmlFailed,
            Self::UnknownInstanceId,
            Self::InsufficientMemory,
            Self::WaitForInit,
            Self::ErrorInRatesRetrieval,
            Self::BidAskIsZero,
            Self::FileWritingError,
        ];
        known.into_iter().find(|c| *c as i32 == code)
    }

    pub fn describe(code: &i32) -> String {
        match Self::from_raw(*code) {
            Some(known) => format!("{:?} ({})", known, code),
            None => format!("unrecognised return code {}", code),
        }
    }
}

/// Errors raised by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Invalid or inconsistent run configuration
    #[error("config error: {0}")]
    Config(String),

    /// Target timeframe below the base timeframe of the history
    #[error("invalid timeframe: target {target} is below base timeframe {base}")]
    InvalidTimeframe { base: u32, target: u32 },

    /// Optimization requested without parameters
    #[error("config error: optimization requested with zero optimization parameters")]
    NoOptimizationParams,

    /// More rate requirements than native buffer slots
    #[error("config error: {0} rate requirements declared, at most 10 supported")]
    TooManyRateBuffers(usize),

    /// Instance id registered twice
    #[error("instance {0} is already initialized")]
    DuplicateInstance(i32),

    /// Non-zero code from the native init call
    #[error("native init of instance {instance_id} failed: {}", ReturnCode::describe(.code))]
    NativeInitFailed { instance_id: i32, code: i32 },

    /// Non-zero code from the native per-bar call
    #[error("native call of instance {instance_id} failed at bar {bar}: {}", ReturnCode::describe(.code))]
    NativeCallFailed { instance_id: i32, bar: usize, code: i32 },

    /// Invoke on an instance that was never initialized
    #[error("instance {0} is not initialized")]
    UnknownInstance(i32),

    /// History file absent
    #[error("data error: missing history file {0}")]
    MissingHistory(std::path::PathBuf),

    /// History row could not be parsed
    #[error("data error: {path}:{line}: {reason}")]
    HistoryParse {
        path: std::path::PathBuf,
        line: usize,
        reason: String,
    },

    /// Timestamps not strictly increasing
    #[error("data error: non-monotonic timestamps in {path} at row {index}")]
    NonMonotonicTimestamps { path: String, index: usize },

    /// Fewer bars than a declared requirement needs
    #[error("data error: {symbol} needs {required} bars, only {available} available")]
    InsufficientBars {
        symbol: String,
        required: usize,
        available: usize,
    },

    /// Modify or close addressed an order the mirror does not hold
    #[error("invariant violation: instance {instance_id} referenced unknown ticket {ticket}")]
    UnknownTicket { instance_id: i32, ticket: i64 },

    /// Strategy opened more orders than allowed
    #[error("strategy error: instance {instance_id} exceeded max open orders ({max})")]
    MaxOpenOrdersExceeded { instance_id: i32, max: usize },

    /// Order book and account ledger diverged
    #[error("invariant violation: instance {instance_id} ledger expected {expected:.6}, mirror holds {actual:.6}")]
    LedgerMismatch {
        instance_id: i32,
        expected: f64,
        actual: f64,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("library error: {0}")]
    Library(#[from] libloading::Error),
}

impl BridgeError {
    /// Category for user-facing reporting: `config`, `native`, `data`, `invariant`.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::Config(_)
            | BridgeError::InvalidTimeframe { .. }
            | BridgeError::NoOptimizationParams
            | BridgeError::TooManyRateBuffers(_)
            | BridgeError::DuplicateInstance(_)
            | BridgeError::MaxOpenOrdersExceeded { .. } => "config",

            BridgeError::NativeInitFailed { .. }
            | BridgeError::NativeCallFailed { .. }
            | BridgeError::UnknownInstance(_)
            | BridgeError::Library(_) => "native",

            BridgeError::MissingHistory(_)
            | BridgeError::HistoryParse { .. }
            | BridgeError::NonMonotonicTimestamps { .. }
            | BridgeError::InsufficientBars { .. }
            | BridgeError::Io(_)
            | BridgeError::Csv(_) => "data",

            BridgeError::UnknownTicket { .. } | BridgeError::LedgerMismatch { .. } => "invariant",
        }
    }

    #[must_use]
    pub fn is_config_error(&self) -> bool {
        self.category() == "config"
    }

    /// Config and invariant errors abort the whole run, not just one instance.
    #[must_use]
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self.category(), "config" | "invariant")
    }

    /// Native code carried by the error, if any.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            BridgeError::NativeInitFailed { code, .. } | BridgeError::NativeCallFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
