// asirikuy_core/src/settings.rs

//! Configuration structures for the Asirikuy bridge.
//! Loads a run configuration from JSON and validates it before any bar is simulated.

use crate::error::{BridgeError, BridgeResult};
use crate::execution;
use crate::native;
use crate::optimization;
use crate::rates;

/// Type of optimizer to use.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub enum OptimizerType {
    #[serde(rename = "Brute_Force")]
    BruteForce,
    #[serde(rename = "Genetic")]
    Genetic { ga_params: GAParams },
}

/// Metric an optimization maximizes or minimizes.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub enum OptimizationGoal {
    #[serde(rename = "Profit")]
    Profit,
    #[serde(rename = "Max_DD")]
    MaxDd,
    #[serde(rename = "Max_DD_Length")]
    MaxDdLength,
    #[serde(rename = "Profit_Factor")]
    ProfitFactor,
    #[serde(rename = "R2")]
    R2,
    #[serde(rename = "Ulcer_Index")]
    UlcerIndex,
    #[serde(rename = "Sharpe")]
    Sharpe,
    #[default]
    #[serde(rename = "CAGR/Max_DD")]
    CagrToMaxDd,
    #[serde(rename = "CAGR")]
    Cagr,
}

impl OptimizationGoal {
    /// Goals where a smaller value is better.
    pub fn is_minimized(&self) -> bool {
        matches!(self, Self::MaxDd | Self::MaxDdLength | Self::UlcerIndex)
    }
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossoverMode {
    #[default]
    #[serde(rename = "Uniform")]
    Uniform,
    #[serde(rename = "Single_Point")]
    SinglePoint,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationMode {
    #[default]
    #[serde(rename = "Uniform")]
    Uniform,
    #[serde(rename = "Step")]
    Step,
}

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Parameters for the Genetic Algorithm optimizer.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct GAParams {
    pub population_size: usize,
    pub max_generations: usize,
    pub crossover_probability: f64,
    pub mutation_probability: f64,
    #[serde(default)]
    pub migration_probability: f64,
    /// Sub-populations evolved independently between migrations.
    #[serde(default = "default_one")]
    pub islands: usize,
    #[serde(default = "default_true")]
    pub elitism: bool,
    #[serde(default)]
    pub crossover_mode: CrossoverMode,
    #[serde(default)]
    pub mutation_mode: MutationMode,
    #[serde(default)]
    pub stop_if_converged: bool,
    /// Candidates trading less often than this get the worst fitness.
    #[serde(default)]
    pub min_trades_a_year: f64,
    /// Fixed seed for reproducible searches.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// One tunable setting's search range. Either `name` or `index` selects the slot.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct OptimizationParamSettings {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
    pub start: f64,
    pub step: f64,
    pub stop: f64,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct OptimizationSettings {
    pub optimizer_type: OptimizerType,
    #[serde(default)]
    pub optimization_goal: OptimizationGoal,
    #[serde(default)]
    pub params: Vec<OptimizationParamSettings>,
}

impl OptimizationSettings {
    /// Resolves names against the settings index table.
    pub fn resolve_params(&self) -> BridgeResult<Vec<optimization::OptimizationParam>> {
        self.params
            .iter()
            .map(|p| {
                let index = match (&p.name, p.index) {
                    (_, Some(index)) if index < native::SETTINGS_SIZE => index,
                    (_, Some(index)) => {
                        return Err(BridgeError::Config(format!("optimization index {} out of range", index)));
                    }
                    (Some(name), None) => native::settings_index::lookup(name)
                        .ok_or_else(|| BridgeError::Config(format!("unknown optimization setting '{}'", name)))?,
                    (None, None) => {
                        return Err(BridgeError::Config("optimization param needs 'name' or 'index'".to_string()));
                    }
                };
                Ok(optimization::OptimizationParam::new(index, p.start, p.step, p.stop))
            })
            .collect()
    }
}

/// Statistics options shared by every instance of a run.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct StatisticsSettings {
    /// Linear R2 fit instead of log-balance when compounding is off.
    #[serde(default)]
    pub disable_compounding: bool,
    /// Whether commission and swap enter profit factor and Sharpe.
    #[serde(default = "default_true")]
    pub include_costs_in_metrics: bool,
}

impl Default for StatisticsSettings {
    fn default() -> Self {
        Self {
            disable_compounding: false,
            include_costs_in_metrics: true,
        }
    }
}

/// Broker-side symbol and account properties of one instance.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct AccountSettings {
    pub contract_size: f64,
    pub digits: u32,
    pub spread: f64,
    pub min_lot_size: f64,
    pub minimum_stop: f64,
    pub leverage: f64,
    pub stop_out_percent: f64,
    pub swap_long: f64,
    pub swap_short: f64,
    pub commission_per_lot: f64,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            contract_size: 100_000.0,
            digits: 5,
            spread: 0.0,
            min_lot_size: 0.01,
            minimum_stop: 0.0,
            leverage: 100.0,
            stop_out_percent: 20.0,
            swap_long: 0.0,
            swap_short: 0.0,
            commission_per_lot: 0.0,
        }
    }
}

/// Settings for one strategy instance of the portfolio.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SystemSettings {
    pub instance_id: i32,
    pub engine_path: String,
    #[serde(default)]
    pub engine_config: String,
    pub symbol: String,
    pub strategy_timeframe: u32,
    /// Setting name (or slot number) -> value.
    #[serde(default)]
    pub settings: std::collections::BTreeMap<String, f64>,
    pub rate_requirements: Vec<rates::RateRequirement>,
    #[serde(default)]
    pub account: AccountSettings,
}

impl SystemSettings {
    /// Builds the 64-slot settings vector handed to the engine.
    /// # Arguments
    /// * `common` - Run-wide settings providing equity and compounding flags.
    /// # Returns
    /// * `BridgeResult<[f64; 64]>`, a config error on unknown names.
    pub fn settings_vector(&self, common: &CommonSettings) -> BridgeResult<[f64; native::SETTINGS_SIZE]> {
        use native::settings_index as idx;

        let mut values = [0.0; native::SETTINGS_SIZE];
        values[idx::MAX_OPEN_ORDERS] = 1.0;
        values[idx::IS_BACKTESTING] = 1.0;
        values[idx::USE_SL] = 1.0;
        values[idx::USE_TP] = 1.0;
        values[idx::DISABLE_COMPOUNDING] = if common.statistics.disable_compounding { 1.0 } else { 0.0 };
        values[idx::ORIGINAL_EQUITY] = common.initial_balance;
        values[idx::STRATEGY_INSTANCE_ID] = self.instance_id as f64;
        values[idx::TIMEFRAME] = self.strategy_timeframe as f64;

        for (name, value) in &self.settings {
            values[resolve_setting_name(name)?] = *value;
        }

        values[idx::ORDERINFO_ARRAY_SIZE] = values[idx::MAX_OPEN_ORDERS];
        Ok(values)
    }
}

/// Resolves a setting by name, or by numeric slot written as a string.
pub fn resolve_setting_name(name: &str) -> BridgeResult<usize> {
    if let Some(index) = native::settings_index::lookup(name) {
        return Ok(index);
    }
    match name.parse::<usize>() {
        Ok(index) if index < native::SETTINGS_SIZE => Ok(index),
        _ => Err(BridgeError::Config(format!("unknown setting '{}'", name))),
    }
}

/// Common settings applicable to the entire run.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CommonSettings {
    pub mode: String,
    pub initial_balance: f64,
    pub account_currency: String,
    #[serde(default)]
    pub broker_name: String,
    #[serde(default)]
    pub ref_broker_name: String,
    #[serde(default)]
    pub account_label: String,
    pub history_path: String,
    pub base_timeframe: u32,
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub to_date: Option<String>,
    pub threads: Option<usize>,
    pub exit_results_path: String,
    #[serde(default)]
    pub statistics: StatisticsSettings,
}

/// Top-level settings structure.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub common: CommonSettings,
    pub systems: Vec<SystemSettings>,
    #[serde(default)]
    pub optimization: Option<OptimizationSettings>,
}

impl Settings {
    /// Loads settings from a JSON file.
    /// # Arguments
    /// * `settings_file_path` - Path to the JSON configuration file.
    /// # Returns
    /// * `anyhow::Result<Settings>` containing the validated settings.
    pub fn load<P: AsRef<std::path::Path>>(settings_file_path: P) -> anyhow::Result<Self> {
        let path = settings_file_path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read settings file {}: {}", path.display(), e))?;
        Self::from_json_str(&contents)
    }

    /// Parses and validates settings from a JSON string.
    pub fn from_json_str(contents: &str) -> anyhow::Result<Self> {
        let mut settings: Settings = serde_json::from_str(contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse settings JSON: {}", e))?;

        check_args(&mut settings)?;

        anyhow::Ok(settings)
    }

    pub fn is_optimization(&self) -> bool {
        self.common.mode == "Optimize"
    }

    pub fn threads(&self) -> usize {
        self.common.threads.unwrap_or_else(num_cpus::get)
    }
}

fn check_args(settings: &mut Settings) -> BridgeResult<()> {
    // check threads
    {
        match settings.common.threads {
            Some(0) => {
                return Err(BridgeError::Config("'threads' cannot be zero".to_string()));
            }
            Some(threads) => {
                let availiable_threads = num_cpus::get();
                if threads > availiable_threads {
                    settings.common.threads = Some(availiable_threads);
                }
            }
            None => {}
        }
    }

    // check mode
    {
        const VALID_MODES: &[&str] = &["Debug", "Optimize"];
        if !VALID_MODES.contains(&settings.common.mode.as_str()) {
            return Err(BridgeError::Config(format!("wrong mode setting, use one of {:?}", VALID_MODES)));
        }
    }

    // check account
    {
        if settings.common.initial_balance <= 0.0 {
            return Err(BridgeError::Config("initial_balance must be positive".to_string()));
        }
        if settings.common.account_currency.len() != 3 {
            return Err(BridgeError::Config(format!(
                "account_currency '{}' must be a 3 letter code",
                settings.common.account_currency
            )));
        }
        if settings.common.base_timeframe == 0 {
            return Err(BridgeError::Config("base_timeframe must be at least 1 minute".to_string()));
        }
    }

    // check dates
    {
        for date in [&settings.common.from_date, &settings.common.to_date].into_iter().flatten() {
            crate::utils::parse_run_date(date).map_err(|e| BridgeError::Config(e.to_string()))?;
        }
    }

    // check systems
    {
        if settings.systems.is_empty() {
            return Err(BridgeError::Config("provide at least one system".to_string()));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for system in &settings.systems {
            if !seen_ids.insert(system.instance_id) {
                return Err(BridgeError::DuplicateInstance(system.instance_id));
            }

            if system.rate_requirements.is_empty() {
                return Err(BridgeError::Config(format!(
                    "system {} declares no rate requirements",
                    system.instance_id
                )));
            }
            if system.rate_requirements.len() > native::MAX_RATES_BUFFERS {
                return Err(BridgeError::TooManyRateBuffers(system.rate_requirements.len()));
            }

            if system.strategy_timeframe < settings.common.base_timeframe {
                return Err(BridgeError::InvalidTimeframe {
                    base: settings.common.base_timeframe,
                    target: system.strategy_timeframe,
                });
            }
            for requirement in &system.rate_requirements {
                if requirement.timeframe != 0 && requirement.timeframe < settings.common.base_timeframe {
                    return Err(BridgeError::InvalidTimeframe {
                        base: settings.common.base_timeframe,
                        target: requirement.timeframe,
                    });
                }
                if requirement.bars == 0 {
                    return Err(BridgeError::Config(format!(
                        "system {} requires zero bars of {}",
                        system.instance_id, requirement.symbol
                    )));
                }
            }

            for name in system.settings.keys() {
                resolve_setting_name(name)?;
            }

            let account = &system.account;
            if account.contract_size <= 0.0 || account.leverage <= 0.0 || account.min_lot_size <= 0.0 {
                return Err(BridgeError::Config(format!(
                    "system {}: contract_size, leverage and min_lot_size must be positive",
                    system.instance_id
                )));
            }
        }
    }

    // check optimization
    {
        if settings.common.mode == "Optimize" {
            let Some(optimization) = &settings.optimization else {
                return Err(BridgeError::NoOptimizationParams);
            };
            if optimization.params.is_empty() {
                return Err(BridgeError::NoOptimizationParams);
            }
            let last_worker = settings.threads().saturating_sub(1);
            for system in &settings.systems {
                execution::candidate_id(system.instance_id, last_worker)?;
            }

            for param in &optimization.params {
                if param.step <= 0.0 {
                    return Err(BridgeError::Config("optimization step must be positive".to_string()));
                }
                if param.stop < param.start {
                    return Err(BridgeError::Config("optimization stop must not be below start".to_string()));
                }
            }
            optimization.resolve_params()?;

            if let OptimizerType::Genetic { ga_params } = &optimization.optimizer_type {
                if ga_params.population_size == 0 {
                    return Err(BridgeError::Config("GA population_size must be greater than 0".to_string()));
                }
                if ga_params.max_generations == 0 {
                    return Err(BridgeError::Config("GA max_generations must be greater than 0".to_string()));
                }
                if ga_params.islands == 0 || ga_params.islands > ga_params.population_size {
                    return Err(BridgeError::Config(
                        "GA islands must be between 1 and population_size".to_string(),
                    ));
                }
                for (name, p) in [
                    ("crossover_probability", ga_params.crossover_probability),
                    ("mutation_probability", ga_params.mutation_probability),
                    ("migration_probability", ga_params.migration_probability),
                ] {
                    if !(0.0..=1.0).contains(&p) {
                        return Err(BridgeError::Config(format!("GA {} must be between 0.0 and 1.0", name)));
                    }
                }
            }
        }
    }

    // check exit path of results
    {
        let normalized_path = settings.common.exit_results_path.trim_end_matches('/');

        if normalized_path.is_empty() {
            return Err(BridgeError::Config("exit path cannot be empty".to_string()));
        }

        let path = std::path::Path::new(normalized_path);
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        } else if !path.is_dir() {
            return Err(BridgeError::Config("exit path is not a directory".to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: &str, optimization: &str, exit: &str) -> String {
        format!(
            r#"{{
                "common": {{
                    "mode": "{mode}",
                    "initial_balance": 10000.0,
                    "account_currency": "USD",
                    "history_path": "history",
                    "base_timeframe": 1,
                    "threads": 2,
                    "exit_results_path": "{exit}"
                }},
                "systems": [{{
                    "instance_id": 7,
                    "engine_path": "libdemo_engine.so",
                    "symbol": "EURUSD",
                    "strategy_timeframe": 60,
                    "settings": {{ "ADDITIONAL_PARAM_1": 14, "MAX_OPEN_ORDERS": 2 }},
                    "rate_requirements": [{{ "symbol": "D", "timeframe": 0, "bars": 50 }}]
                }}]
                {optimization}
            }}"#
        )
    }

    #[test]
    fn test_load_debug_config() {
        let dir = tempfile::tempdir().unwrap();
        let exit = dir.path().join("out");
        let settings = Settings::from_json_str(&config("Debug", "", exit.to_str().unwrap())).unwrap();
        assert!(!settings.is_optimization());
        assert!(exit.is_dir());

        let vector = settings.systems[0].settings_vector(&settings.common).unwrap();
        assert_eq!(vector[0], 14.0);
        assert_eq!(vector[native::settings_index::MAX_OPEN_ORDERS], 2.0);
        assert_eq!(vector[native::settings_index::ORDERINFO_ARRAY_SIZE], 2.0);
        assert_eq!(vector[native::settings_index::TIMEFRAME], 60.0);
        assert_eq!(vector[native::settings_index::STRATEGY_INSTANCE_ID], 7.0);
    }

    #[test]
    fn test_optimize_without_params_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let optimization = r#", "optimization": { "optimizer_type": "Brute_Force", "params": [] }"#;
        let err = Settings::from_json_str(&config("Optimize", optimization, dir.path().to_str().unwrap())).unwrap_err();
        let bridge = err.downcast_ref::<BridgeError>().unwrap();
        assert!(matches!(bridge, BridgeError::NoOptimizationParams));
        assert!(bridge.is_config_error());
    }

    /// Adds systems with the given ids, copied from the first one.
    fn with_systems(json: &str, ids: &[i64]) -> String {
        let mut value: serde_json::Value = serde_json::from_str(json).unwrap();
        let template = value["systems"][0].clone();
        let systems = value["systems"].as_array_mut().unwrap();
        for id in ids {
            let mut system = template.clone();
            system["instance_id"] = serde_json::json!(id);
            systems.push(system);
        }
        value.to_string()
    }

    #[test]
    fn test_optimize_accepts_several_systems() {
        let dir = tempfile::tempdir().unwrap();
        let optimization = r#", "optimization": {
            "optimizer_type": "Brute_Force",
            "params": [ { "name": "ADDITIONAL_PARAM_1", "start": 5, "step": 5, "stop": 20 } ]
        }"#;
        let json = with_systems(&config("Optimize", optimization, dir.path().to_str().unwrap()), &[8, 9]);
        let settings = Settings::from_json_str(&json).unwrap();
        assert!(settings.is_optimization());
        assert_eq!(settings.systems.len(), 3);
    }

    #[test]
    fn test_optimize_rejects_ids_beyond_candidate_range() {
        let dir = tempfile::tempdir().unwrap();
        let optimization = r#", "optimization": {
            "optimizer_type": "Brute_Force",
            "params": [ { "name": "ADDITIONAL_PARAM_1", "start": 5, "step": 5, "stop": 20 } ]
        }"#;
        let json = with_systems(&config("Optimize", optimization, dir.path().to_str().unwrap()), &[3_000_000]);
        let err = Settings::from_json_str(&json).unwrap_err();
        assert!(err.downcast_ref::<BridgeError>().unwrap().is_config_error());

        // the same id is fine for a single test
        let json = with_systems(&config("Debug", "", dir.path().to_str().unwrap()), &[3_000_000]);
        assert!(Settings::from_json_str(&json).is_ok());
    }

    #[test]
    fn test_genetic_probability_range() {
        let dir = tempfile::tempdir().unwrap();
        let optimization = r#", "optimization": {
            "optimizer_type": { "Genetic": { "ga_params": {
                "population_size": 10, "max_generations": 5,
                "crossover_probability": 1.5, "mutation_probability": 0.1
            } } },
            "optimization_goal": "Sharpe",
            "params": [ { "name": "ADDITIONAL_PARAM_1", "start": 5, "step": 5, "stop": 20 } ]
        }"#;
        let err = Settings::from_json_str(&config("Optimize", optimization, dir.path().to_str().unwrap())).unwrap_err();
        assert!(err.to_string().contains("crossover_probability"));
    }

    #[test]
    fn test_unknown_setting_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let json = config("Debug", "", dir.path().to_str().unwrap()).replace("ADDITIONAL_PARAM_1", "NOT_A_SETTING");
        assert!(Settings::from_json_str(&json).is_err());
    }

    #[test]
    fn test_resolve_params_by_name_and_index() {
        let optimization = OptimizationSettings {
            optimizer_type: OptimizerType::BruteForce,
            optimization_goal: OptimizationGoal::Profit,
            params: vec![
                OptimizationParamSettings { name: Some("ADDITIONAL_PARAM_3".into()), index: None, start: 0.0, step: 1.0, stop: 3.0 },
                OptimizationParamSettings { name: None, index: Some(5), start: 1.0, step: 0.5, stop: 2.0 },
            ],
        };
        let params = optimization.resolve_params().unwrap();
        assert_eq!(params[0].get_index(), 2);
        assert_eq!(params[1].get_index(), 5);
    }
}
