// asirikuy_core/src/engine_loader.rs

//! `NativeEngine` backed by a dynamically loaded strategy framework library.

use crate::error::{BridgeResult, ReturnCode};
use crate::native::{self, CRates, CRatesInfo, COrderInfo, NativeEngine};

use std::os::raw::{c_char, c_int};

type InitInstanceFn = unsafe extern "C" fn(c_int, c_int, *const c_char, *const c_char) -> c_int;
type DeinitInstanceFn = unsafe extern "C" fn(c_int) -> c_int;
type FrameworkVersionFn = unsafe extern "C" fn(*mut c_int, *mut c_int, *mut c_int);
type RunStrategyFn = unsafe extern "C" fn(
    *const f64,
    *const c_char,
    *const c_char,
    *const c_char,
    *const c_char,
    *const c_int,
    *const c_int,
    *const COrderInfo,
    *const f64,
    *const f64,
    *const CRatesInfo,
    *const CRates,
    *const CRates,
    *const CRates,
    *const CRates,
    *const CRates,
    *const CRates,
    *const CRates,
    *const CRates,
    *const CRates,
    *const CRates,
    *mut f64,
) -> c_int;

pub struct LibraryEngine {
    _lib: libloading::Library,
    path: std::path::PathBuf,
    init_fn: InitInstanceFn,
    deinit_fn: DeinitInstanceFn,
    run_fn: RunStrategyFn,
    version_fn: Option<FrameworkVersionFn>,
}

impl LibraryEngine {
    /// Loads the framework library and resolves its exports.
    /// # Arguments
    /// * `path` - Path to the shared library.
    /// # Returns
    /// * `BridgeResult<Self>` - The engine, or a library error when a required export is missing.
    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> BridgeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lib = unsafe { libloading::Library::new(&path)? };

        let init_fn: InitInstanceFn = unsafe { *lib.get::<InitInstanceFn>(b"initInstanceC")? };
        let deinit_fn: DeinitInstanceFn = unsafe { *lib.get::<DeinitInstanceFn>(b"deinitInstance")? };
        let run_fn: RunStrategyFn = unsafe { *lib.get::<RunStrategyFn>(b"c_runStrategy")? };
        let version_fn: Option<FrameworkVersionFn> =
            unsafe { lib.get::<FrameworkVersionFn>(b"getFrameworkVersion").ok().map(|s| *s) };

        let engine = Self {
            _lib: lib,
            path,
            init_fn,
            deinit_fn,
            run_fn,
            version_fn,
        };
        let (major, minor, bugfix) = engine.framework_version();
        tracing::info!(
            "Loaded strategy framework {} v{}.{}.{}",
            engine.path.display(),
            major,
            minor,
            bugfix
        );
        Ok(engine)
    }

    pub fn get_path(&self) -> &std::path::Path {
        &self.path
    }
}

impl NativeEngine for LibraryEngine {
    fn init_instance(&self, instance_id: i32, is_backtesting: bool, config_path: &str, account_label: &str) -> i32 {
        let (Ok(config), Ok(account)) = (std::ffi::CString::new(config_path), std::ffi::CString::new(account_label))
        else {
            return ReturnCode::InvalidConfig as i32;
        };
        unsafe { (self.init_fn)(instance_id, is_backtesting as c_int, config.as_ptr(), account.as_ptr()) }
    }

    fn run_bar(&self, snapshot: &native::BarSnapshot<'_>) -> native::BarOutcome {
        let strings = [
            snapshot.symbol,
            snapshot.account_currency,
            snapshot.broker_name,
            snapshot.ref_broker_name,
        ]
        .map(std::ffi::CString::new);
        let [Ok(symbol), Ok(currency), Ok(broker), Ok(ref_broker)] = strings else {
            return native::BarOutcome::failure(ReturnCode::InvalidParameter as i32);
        };

        let mut rates_info = [CRatesInfo::default(); native::MAX_RATES_BUFFERS];
        let mut rates: Vec<Vec<CRates>> = vec![Vec::new(); native::MAX_RATES_BUFFERS];
        for view in &snapshot.buffers {
            let slot = view.descriptor.slot;
            if slot >= native::MAX_RATES_BUFFERS {
                continue;
            }
            rates_info[slot] = view.descriptor.to_c(view.bars.len());
            rates[slot] = view.bars.iter().map(CRates::from).collect();
        }
        let rate_ptr = |slot: usize| -> *const CRates {
            if rates[slot].is_empty() { std::ptr::null() } else { rates[slot].as_ptr() }
        };

        let max_orders = snapshot.max_open_orders();
        let mut results = vec![0.0f64; native::STRATEGY_RESULT_SIZE * max_orders];
        let current_time = snapshot.current_time as c_int;
        let open_count = snapshot.open_orders.len() as c_int;
        let orders_ptr = if snapshot.open_orders.is_empty() {
            std::ptr::null()
        } else {
            snapshot.open_orders.as_ptr()
        };

        let code = unsafe {
            (self.run_fn)(
                snapshot.settings.as_ptr(),
                symbol.as_ptr(),
                currency.as_ptr(),
                broker.as_ptr(),
                ref_broker.as_ptr(),
                &current_time,
                &open_count,
                orders_ptr,
                snapshot.account_info.as_ptr(),
                snapshot.bid_ask.as_ptr(),
                rates_info.as_ptr(),
                rate_ptr(0),
                rate_ptr(1),
                rate_ptr(2),
                rate_ptr(3),
                rate_ptr(4),
                rate_ptr(5),
                rate_ptr(6),
                rate_ptr(7),
                rate_ptr(8),
                rate_ptr(9),
                results.as_mut_ptr(),
            )
        };

        if code != ReturnCode::Success as i32 {
            return native::BarOutcome::failure(code);
        }
        native::BarOutcome::success(
            results
                .chunks(native::STRATEGY_RESULT_SIZE)
                .map(native::StrategyResult::from_slice)
                .collect(),
        )
    }

    fn deinit_instance(&self, instance_id: i32) {
        let code = unsafe { (self.deinit_fn)(instance_id) };
        if code != ReturnCode::Success as i32 {
            tracing::warn!("deinit of instance {} returned {}", instance_id, ReturnCode::describe(&code));
        }
    }

    fn framework_version(&self) -> (i32, i32, i32) {
        let Some(version_fn) = self.version_fn else {
            return (0, 0, 0);
        };
        let (mut major, mut minor, mut bugfix) = (0, 0, 0);
        unsafe { version_fn(&mut major, &mut minor, &mut bugfix) };
        (major, minor, bugfix)
    }
}

// The library handle is only read after loading; the framework itself
// serializes per-instance state and the registry keeps one call per instance.
unsafe impl Send for LibraryEngine {}
unsafe impl Sync for LibraryEngine {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn test_missing_library_is_library_error() {
        let result = LibraryEngine::load_from_path("/nonexistent/libframework.so");
        match result {
            Err(err @ BridgeError::Library(_)) => assert_eq!(err.category(), "native"),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("loaded a library that does not exist"),
        }
    }
}
