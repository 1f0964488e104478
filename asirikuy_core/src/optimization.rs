// asirikuy_core/src/optimization.rs

//! Optimization Driver.
//! Explores a strategy's parameter grid exhaustively (brute force) or with an
//! island genetic algorithm. Every candidate is one full execution loop run;
//! completed evaluations are pushed through a single-lock sink.

use rand::prelude::*;
use rayon::prelude::*;
use itertools::Itertools;
use std::hash::Hash;
use std::hash::Hasher;

use crate::context;
use crate::error::{BridgeError, BridgeResult};
use crate::native;
use crate::report;
use crate::settings;
use crate::statistics;

/// One tunable setting's search range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizationParam {
    index: usize,
    start: f64,
    step: f64,
    stop: f64,
}

impl OptimizationParam {
    pub fn new(index: usize, start: f64, step: f64, stop: f64) -> Self {
        Self { index, start, step, stop }
    }

    pub fn get_index(&self) -> usize {
        self.index
    }

    pub fn get_start(&self) -> f64 {
        self.start
    }

    pub fn get_step(&self) -> f64 {
        self.step
    }

    pub fn get_stop(&self) -> f64 {
        self.stop
    }

    /// Every value from start to stop inclusive.
    pub fn values(&self) -> Vec<f64> {
        if self.step <= 0.0 || self.stop < self.start {
            return vec![self.start];
        }
        let count = ((self.stop - self.start) / self.step + 1e-9).floor() as usize + 1;
        (0..count).map(|k| self.start + k as f64 * self.step).collect()
    }
}

/// Values of one candidate, paired with their settings slots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterSet {
    values: Vec<(usize, f64)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn with_values(mut self, values: Vec<(usize, f64)>) -> Self {
        self.values = values;
        self
    }

    pub fn get_values(&self) -> &[(usize, f64)] {
        &self.values
    }

    /// Writes the candidate into a settings vector.
    pub fn apply_to(&self, settings: &mut [f64; native::SETTINGS_SIZE]) {
        for (index, value) in &self.values {
            if let Some(slot) = settings.get_mut(*index) {
                *slot = *value;
            }
        }
    }

    pub fn format_for_display(&self) -> String {
        let params_str = self
            .values
            .iter()
            .map(|(index, value)| format!("'{}': {}", native::settings_index::name(*index), value))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{}}}", params_str)
    }
}

/// Result of evaluating one candidate.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    iteration: usize,
    parameters: ParameterSet,
    result: statistics::TestResult,
    fitness: f64,
}

impl OptimizationResult {
    pub fn new() -> Self {
        Self {
            iteration: 0,
            parameters: ParameterSet::new(),
            result: statistics::TestResult::default(),
            fitness: 0.0,
        }
    }

    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_parameters(mut self, parameters: ParameterSet) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_result(mut self, result: statistics::TestResult) -> Self {
        self.result = result;
        self
    }

    pub fn with_fitness(mut self, fitness: f64) -> Self {
        self.fitness = fitness;
        self
    }

    // Getters

    pub fn get_iteration(&self) -> usize {
        self.iteration
    }

    pub fn get_parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn get_result(&self) -> &statistics::TestResult {
        &self.result
    }

    /// Raw value of the optimization goal.
    pub fn get_fitness(&self) -> f64 {
        self.fitness
    }
}

impl Default for OptimizationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the brute-force grid: the Cartesian product of every parameter's values.
pub fn generate_all_combinations(params: &[OptimizationParam]) -> Vec<ParameterSet> {
    let ranges: Vec<Vec<f64>> = params.iter().map(OptimizationParam::values).collect();
    ranges
        .iter()
        .multi_cartesian_product()
        .map(|values| {
            ParameterSet::new().with_values(params.iter().zip(values).map(|(p, v)| (p.index, *v)).collect())
        })
        .collect()
}

pub fn calculate_total_combinations(params: &[OptimizationParam]) -> usize {
    if params.is_empty() {
        return 0;
    }
    params.iter().map(|p| p.values().len()).product()
}

/// Comparable score: larger is better on every goal.
pub fn goal_score(goal: settings::OptimizationGoal, value: f64) -> f64 {
    if !value.is_finite() {
        return f64::NEG_INFINITY;
    }
    if goal.is_minimized() { -value } else { value }
}

/// Runs one candidate to completion. `worker` is the index of the thread doing it.
pub trait CandidateRunner: Send + Sync {
    fn evaluate(&self, parameters: &ParameterSet, worker: usize) -> BridgeResult<statistics::TestResult>;
}

impl<F> CandidateRunner for F
where
    F: Fn(&ParameterSet, usize) -> BridgeResult<statistics::TestResult> + Send + Sync,
{
    fn evaluate(&self, parameters: &ParameterSet, worker: usize) -> BridgeResult<statistics::TestResult> {
        self(parameters, worker)
    }
}

/// Completed evaluation as delivered to observers.
#[derive(Debug, Clone)]
pub struct OptimizationEvent {
    pub iteration: usize,
    pub total: usize,
    pub parameters: ParameterSet,
    pub result: statistics::TestResult,
}

type UpdateCallback = Box<dyn FnMut(&OptimizationEvent) + Send>;

struct SinkState {
    iteration: usize,
    total: usize,
    writer: Option<report::OptimizationWriter>,
    sender: Option<std::sync::mpsc::Sender<OptimizationEvent>>,
    callback: Option<UpdateCallback>,
}

/// Shared output of an optimization. The iteration counter, the result file,
/// the channel and the callback sit behind one lock so workers never interleave.
pub struct OptimizationSink {
    goal: settings::OptimizationGoal,
    state: std::sync::Mutex<SinkState>,
}

impl OptimizationSink {
    pub fn new(goal: settings::OptimizationGoal) -> Self {
        Self {
            goal,
            state: std::sync::Mutex::new(SinkState {
                iteration: 0,
                total: 0,
                writer: None,
                sender: None,
                callback: None,
            }),
        }
    }

    pub fn with_writer(self, writer: report::OptimizationWriter) -> Self {
        self.lock().writer = Some(writer);
        self
    }

    pub fn with_channel(self, sender: std::sync::mpsc::Sender<OptimizationEvent>) -> Self {
        self.lock().sender = Some(sender);
        self
    }

    pub fn with_callback<C>(self, callback: C) -> Self
    where
        C: FnMut(&OptimizationEvent) + Send + 'static,
    {
        self.lock().callback = Some(Box::new(callback));
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn get_goal(&self) -> settings::OptimizationGoal {
        self.goal
    }

    pub fn set_total(&self, total: usize) {
        self.lock().total = total;
    }

    pub fn get_iterations(&self) -> usize {
        self.lock().iteration
    }

    /// Numbers the evaluation, writes its row and notifies observers.
    pub fn record(
        &self,
        parameters: &ParameterSet,
        result: statistics::TestResult,
    ) -> BridgeResult<OptimizationResult> {
        let fitness = result.goal_value(self.goal);
        let mut state = self.lock();
        state.iteration += 1;
        let iteration = state.iteration;
        let total = state.total;

        tracing::info!(
            "# {} from {} {} -> {:?} {:.4} ({} trades)",
            iteration,
            total,
            parameters.format_for_display(),
            self.goal,
            fitness,
            result.total_trades
        );

        if let Some(writer) = state.writer.as_mut() {
            writer.write_row(iteration, parameters, &result)?;
        }

        let event = OptimizationEvent {
            iteration,
            total,
            parameters: parameters.clone(),
            result: result.clone(),
        };
        if let Some(sender) = &state.sender {
            if sender.send(event.clone()).is_err() {
                tracing::debug!("Optimization receiver dropped, events no longer delivered");
                state.sender = None;
            }
        }
        if let Some(callback) = state.callback.as_mut() {
            callback(&event);
        }

        Ok(OptimizationResult::new()
            .with_iteration(iteration)
            .with_parameters(parameters.clone())
            .with_result(result)
            .with_fitness(fitness))
    }

    pub fn flush(&self) -> BridgeResult<()> {
        if let Some(writer) = self.lock().writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Moves candidates to workers and completed results back.
/// Candidates skipped because of a stop request come back as `None`.
pub trait WorkPool {
    fn evaluate_batch(
        &self,
        runner: &dyn CandidateRunner,
        batch: &[ParameterSet],
        sink: &OptimizationSink,
        stop: &context::StopHandle,
    ) -> BridgeResult<Vec<Option<OptimizationResult>>>;
}

/// Rayon thread pool on this machine.
pub struct LocalPool {
    threads: usize,
}

impl LocalPool {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.clamp(1, num_cpus::get().max(1)),
        }
    }

    pub fn get_threads(&self) -> usize {
        self.threads
    }
}

impl WorkPool for LocalPool {
    fn evaluate_batch(
        &self,
        runner: &dyn CandidateRunner,
        batch: &[ParameterSet],
        sink: &OptimizationSink,
        stop: &context::StopHandle,
    ) -> BridgeResult<Vec<Option<OptimizationResult>>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to create thread pool: {}", e)))?;

        pool.install(|| {
            batch
                .par_iter()
                .map(|parameters| {
                    if stop.is_stop_requested() {
                        return Ok(None);
                    }
                    let worker = rayon::current_thread_index().unwrap_or(0);
                    let start_time = std::time::Instant::now();
                    let result = runner.evaluate(parameters, worker)?;
                    let recorded = sink.record(parameters, result)?;
                    tracing::debug!(
                        "# {} is done in {:.3} seconds",
                        recorded.get_iteration(),
                        start_time.elapsed().as_secs_f64()
                    );
                    Ok(Some(recorded))
                })
                .collect()
        })
    }
}

// --- BRUTE FORCE ---

/// Exhaustive search over the Cartesian grid.
#[derive(Debug, Clone)]
pub struct BruteForceOptimizer {
    params: Vec<OptimizationParam>,
}

impl BruteForceOptimizer {
    /// # Returns
    /// * `NoOptimizationParams` when the grid would be empty.
    pub fn new(params: Vec<OptimizationParam>) -> BridgeResult<Self> {
        if params.is_empty() {
            return Err(BridgeError::NoOptimizationParams);
        }
        Ok(Self { params })
    }

    pub fn calculate_total_combinations(&self) -> usize {
        calculate_total_combinations(&self.params)
    }

    /// Evaluates every grid point. A stop request skips the candidates not yet started.
    /// # Returns
    /// * Completed evaluations in iteration order.
    pub fn run(
        &self,
        runner: &dyn CandidateRunner,
        pool: &dyn WorkPool,
        sink: &OptimizationSink,
        stop: &context::StopHandle,
    ) -> BridgeResult<Vec<OptimizationResult>> {
        let combinations = generate_all_combinations(&self.params);
        sink.set_total(combinations.len());
        tracing::info!("Brute force over {} combinations", combinations.len());

        let mut results: Vec<OptimizationResult> =
            pool.evaluate_batch(runner, &combinations, sink, stop)?.into_iter().flatten().collect();
        results.sort_by_key(OptimizationResult::get_iteration);

        if results.len() < combinations.len() {
            tracing::info!("Optimization stopped after {} of {} candidates", results.len(), combinations.len());
        }
        Ok(results)
    }
}

// --- GENETIC ALGORITHM ---

/// Statistics for a single generation of the Genetic Algorithm.
#[derive(Debug, Clone, Default)]
pub struct GAStatsPerGeneration {
    best_fitness: f64,
    worst_fitness: f64,
    mean_fitness: f64,
    best_chromosome_id: String,
    generation: usize,
}

impl GAStatsPerGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_best_fitness(mut self, value: f64) -> Self {
        self.best_fitness = value;
        self
    }

    pub fn with_worst_fitness(mut self, value: f64) -> Self {
        self.worst_fitness = value;
        self
    }

    pub fn with_mean_fitness(mut self, value: f64) -> Self {
        self.mean_fitness = value;
        self
    }

    pub fn with_best_chromosome_id(mut self, id: String) -> Self {
        self.best_chromosome_id = id;
        self
    }

    pub fn with_generation(mut self, number: usize) -> Self {
        self.generation = number;
        self
    }

    // Getters

    pub fn get_best_fitness(&self) -> f64 {
        self.best_fitness
    }

    pub fn get_worst_fitness(&self) -> f64 {
        self.worst_fitness
    }

    pub fn get_mean_fitness(&self) -> f64 {
        self.mean_fitness
    }

    pub fn get_best_chromosome_id(&self) -> &str {
        &self.best_chromosome_id
    }

    pub fn get_generation(&self) -> usize {
        self.generation
    }
}

/// Gene = index into the parameter's value list.
type Chromosome = Vec<usize>;

#[derive(Debug, Clone)]
struct Scored {
    chromosome: Chromosome,
    /// Larger is better; penalized candidates score `-inf`.
    score: f64,
    value: f64,
}

/// Outcome of a genetic search.
#[derive(Debug, Clone, Default)]
pub struct GeneticReport {
    pub generations: Vec<GAStatsPerGeneration>,
    pub evaluations: Vec<OptimizationResult>,
    pub converged: bool,
}

impl GeneticReport {
    /// Best candidate by the search's goal.
    pub fn best(&self, goal: settings::OptimizationGoal) -> Option<&OptimizationResult> {
        self.evaluations.iter().max_by(|a, b| {
            goal_score(goal, a.get_fitness())
                .partial_cmp(&goal_score(goal, b.get_fitness()))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

pub struct GeneticOptimizer {
    params: Vec<OptimizationParam>,
    ranges: Vec<Vec<f64>>,
    ga_params: settings::GAParams,
    goal: settings::OptimizationGoal,
    chromosome_bank: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<u64, Option<(f64, f64)>>>>,
}

impl GeneticOptimizer {
    pub fn new(
        params: Vec<OptimizationParam>,
        ga_params: settings::GAParams,
        goal: settings::OptimizationGoal,
    ) -> BridgeResult<Self> {
        if params.is_empty() {
            return Err(BridgeError::NoOptimizationParams);
        }
        let ranges = params.iter().map(OptimizationParam::values).collect();
        Ok(Self {
            params,
            ranges,
            ga_params,
            goal,
            chromosome_bank: std::sync::Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        })
    }

    fn to_parameter_set(&self, chromosome: &Chromosome) -> ParameterSet {
        ParameterSet::new().with_values(
            self.params
                .iter()
                .zip(&self.ranges)
                .zip(chromosome)
                .map(|((p, range), gene)| (p.index, range[*gene]))
                .collect(),
        )
    }

    fn random_chromosome(&self, rng: &mut impl rand::Rng) -> Chromosome {
        self.ranges.iter().map(|r| rng.gen_range(0..r.len())).collect()
    }

    fn score(&self, result: &statistics::TestResult) -> (f64, f64) {
        let value = result.goal_value(self.goal);
        let penalized = result.failure.is_some()
            || (self.ga_params.min_trades_a_year > 0.0 && result.trades_per_year() < self.ga_params.min_trades_a_year);
        if penalized {
            (f64::NEG_INFINITY, value)
        } else {
            (goal_score(self.goal, value), value)
        }
    }

    fn island_sizes(&self) -> Vec<usize> {
        let islands = self.ga_params.islands.max(1);
        let size = self.ga_params.population_size.max(islands);
        (0..islands)
            .map(|i| size / islands + usize::from(i < size % islands))
            .collect()
    }

    /// Runs the search.
    /// # Arguments
    /// * `runner` - Evaluates one candidate.
    /// * `pool` - Moves each generation's new candidates to workers.
    /// * `sink` - Receives every completed evaluation exactly once.
    /// * `stop` - Checked between generations. A generation already started is evaluated in full.
    pub fn run(
        &self,
        runner: &dyn CandidateRunner,
        pool: &dyn WorkPool,
        sink: &OptimizationSink,
        stop: &context::StopHandle,
    ) -> BridgeResult<GeneticReport> {
        let mut rng = match self.ga_params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut report = GeneticReport::default();
        let total_space = calculate_total_combinations(&self.params);
        sink.set_total(total_space.min(self.ga_params.population_size * self.ga_params.max_generations));

        let mut islands: Vec<Vec<Chromosome>> = self
            .island_sizes()
            .into_iter()
            .map(|size| (0..size).map(|_| self.random_chromosome(&mut rng)).collect())
            .collect();

        for gen_idx in 0..self.ga_params.max_generations {
            if stop.is_stop_requested() {
                tracing::info!("Genetic search stopped before generation {}", gen_idx);
                break;
            }

            let evaluated = self.evaluate_generation(&islands, runner, pool, sink, &mut report)?;

            let stat = self.calculate_generation_stats(&evaluated, gen_idx);
            tracing::info!(
                "Generation {}: Best Fitness= {:.3}, Mean Fitness= {:.3}, Worst Fitness= {:.3}",
                gen_idx,
                stat.best_fitness,
                stat.mean_fitness,
                stat.worst_fitness
            );
            report.generations.push(stat);

            if stop.is_stop_requested() {
                tracing::info!("Genetic search stopped after generation {}", gen_idx);
                break;
            }

            if self.ga_params.stop_if_converged && self.is_converged(&evaluated) {
                tracing::info!("Population converged at generation {}", gen_idx);
                report.converged = true;
                break;
            }

            if gen_idx + 1 < self.ga_params.max_generations {
                let mut evaluated = evaluated;
                self.migrate(&mut evaluated, &mut rng);
                islands = evaluated
                    .iter()
                    .map(|island| self.tournament_selection(island, island.len(), &mut rng))
                    .collect();
            }
        }

        report.evaluations.sort_by_key(OptimizationResult::get_iteration);
        Ok(report)
    }

    /// Evaluates chromosomes not yet in the bank, then scores every island.
    fn evaluate_generation(
        &self,
        islands: &[Vec<Chromosome>],
        runner: &dyn CandidateRunner,
        pool: &dyn WorkPool,
        sink: &OptimizationSink,
        report: &mut GeneticReport,
    ) -> BridgeResult<Vec<Vec<Scored>>> {
        let mut pending: Vec<Chromosome> = Vec::new();
        {
            let bank = self.chromosome_bank.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut seen = std::collections::HashSet::new();
            for chromosome in islands.iter().flatten() {
                let hash = hash_chromosome(chromosome);
                if !bank.contains_key(&hash) && seen.insert(hash) {
                    pending.push(chromosome.clone());
                }
            }
        }

        let batch: Vec<ParameterSet> = pending.iter().map(|c| self.to_parameter_set(c)).collect();
        // the whole generation runs even if a stop arrives meanwhile
        let results = pool.evaluate_batch(runner, &batch, sink, &context::StopHandle::new())?;

        {
            let mut bank = self.chromosome_bank.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for (chromosome, result) in pending.iter().zip(results) {
                if let Some(result) = result {
                    bank.insert(hash_chromosome(chromosome), Some(self.score(result.get_result())));
                    report.evaluations.push(result);
                }
            }
        }

        let bank = self.chromosome_bank.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let scored = islands
            .iter()
            .map(|island| {
                island
                    .iter()
                    .map(|chromosome| {
                        let (score, value) = bank
                            .get(&hash_chromosome(chromosome))
                            .copied()
                            .flatten()
                            .unwrap_or((f64::NEG_INFINITY, 0.0));
                        Scored {
                            chromosome: chromosome.clone(),
                            score,
                            value,
                        }
                    })
                    .collect()
            })
            .collect();
        Ok(scored)
    }

    /// Calculates statistics (mean, best, worst) for a vector of fitness scores.
    fn calculate_stats(&self, values: &[f64]) -> (f64, f64, f64) {
        if values.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let max = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let min = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        (mean, max, min)
    }

    fn calculate_generation_stats(&self, islands: &[Vec<Scored>], gen_idx: usize) -> GAStatsPerGeneration {
        let valid: Vec<&Scored> = islands.iter().flatten().filter(|s| s.score.is_finite()).collect();
        let values: Vec<f64> = valid.iter().map(|s| s.value).collect();
        let (mean, max, min) = self.calculate_stats(&values);
        let (best, worst) = if self.goal.is_minimized() { (min, max) } else { (max, min) };

        let best_id = valid
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            .map(|s| self.to_parameter_set(&s.chromosome).format_for_display())
            .unwrap_or_default();

        GAStatsPerGeneration::new()
            .with_best_fitness(best)
            .with_worst_fitness(worst)
            .with_mean_fitness(mean)
            .with_best_chromosome_id(best_id)
            .with_generation(gen_idx)
    }

    /// Converged once every island holds a single genome or every score is equal.
    fn is_converged(&self, islands: &[Vec<Scored>]) -> bool {
        let all: Vec<&Scored> = islands.iter().flatten().collect();
        let Some(first) = all.first() else {
            return true;
        };
        let same_genome = all.iter().all(|s| s.chromosome == first.chromosome);
        let same_score = all.iter().all(|s| {
            s.score == first.score || (s.score - first.score).abs() <= 1e-9 * first.score.abs().max(1.0)
        });
        same_genome || same_score
    }

    /// Ring migration: island i's best replaces island i+1's worst.
    fn migrate(&self, islands: &mut [Vec<Scored>], rng: &mut impl rand::Rng) {
        let count = islands.len();
        if count < 2 || self.ga_params.migration_probability <= 0.0 {
            return;
        }
        if !rng.gen_bool(self.ga_params.migration_probability.min(1.0)) {
            return;
        }
        let migrants: Vec<Option<Scored>> = islands.iter().map(|island| best_of(island).cloned()).collect();
        for (i, migrant) in migrants.into_iter().enumerate() {
            let target = &mut islands[(i + 1) % count];
            if let (Some(migrant), Some(worst)) = (migrant, worst_index(target)) {
                tracing::debug!("Migrating chromosome {:?} from island {} to {}", migrant.chromosome, i, (i + 1) % count);
                target[worst] = migrant;
            }
        }
    }

    /// Selects a parent chromosome using tournament selection.
    fn choose_parent<'a>(&self, island: &'a [Scored], rng: &mut impl rand::Rng) -> &'a Chromosome {
        let a = &island[rng.gen_range(0..island.len())];
        let b = &island[rng.gen_range(0..island.len())];
        if a.score >= b.score { &a.chromosome } else { &b.chromosome }
    }

    /// Performs crossover and mutation on two parent chromosomes to create a child.
    fn crossover_mutation(&self, a: &Chromosome, b: &Chromosome, rng: &mut impl rand::Rng) -> Chromosome {
        let mut child = a.clone();

        if rng.gen_bool(self.ga_params.crossover_probability.clamp(0.0, 1.0)) {
            match self.ga_params.crossover_mode {
                settings::CrossoverMode::Uniform => {
                    for (gene, other) in child.iter_mut().zip(b) {
                        if rng.gen_bool(0.5) {
                            *gene = *other;
                        }
                    }
                }
                settings::CrossoverMode::SinglePoint => {
                    let cut = rng.gen_range(0..=child.len());
                    child[cut..].copy_from_slice(&b[cut..]);
                }
            }
        }

        for (gene, range) in child.iter_mut().zip(&self.ranges) {
            if range.len() < 2 || !rng.gen_bool(self.ga_params.mutation_probability.clamp(0.0, 1.0)) {
                continue;
            }
            *gene = match self.ga_params.mutation_mode {
                settings::MutationMode::Uniform => rng.gen_range(0..range.len()),
                settings::MutationMode::Step => {
                    if *gene == 0 || (*gene + 1 < range.len() && rng.gen_bool(0.5)) {
                        *gene + 1
                    } else {
                        *gene - 1
                    }
                }
            };
        }
        child
    }

    /// Next generation of one island.
    fn tournament_selection(&self, island: &[Scored], size: usize, rng: &mut impl rand::Rng) -> Vec<Chromosome> {
        let mut next_gen = Vec::with_capacity(size);
        if island.is_empty() {
            return next_gen;
        }

        // keep the best individual
        if self.ga_params.elitism {
            if let Some(best) = best_of(island) {
                next_gen.push(best.chromosome.clone());
            }
        }

        while next_gen.len() < size {
            let parent_a = self.choose_parent(island, rng);
            let parent_b = self.choose_parent(island, rng);
            next_gen.push(self.crossover_mutation(parent_a, parent_b, rng));
        }
        next_gen
    }
}

fn best_of(island: &[Scored]) -> Option<&Scored> {
    island
        .iter()
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
}

fn worst_index(island: &[Scored]) -> Option<usize> {
    island
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

/// Hashes a chromosome for the fitness cache.
fn hash_chromosome(chromosome: &Chromosome) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    chromosome.hash(&mut hasher);
    hasher.finish()
}

/// Everything an optimization produced.
#[derive(Debug, Clone, Default)]
pub struct OptimizationSummary {
    pub evaluations: Vec<OptimizationResult>,
    pub generations: Vec<GAStatsPerGeneration>,
}

impl OptimizationSummary {
    pub fn best(&self, goal: settings::OptimizationGoal) -> Option<&OptimizationResult> {
        self.evaluations
            .iter()
            .filter(|r| r.get_result().failure.is_none())
            .max_by(|a, b| {
                goal_score(goal, a.get_fitness())
                    .partial_cmp(&goal_score(goal, b.get_fitness()))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Runs the optimizer the settings select. Zero parameters fail before any candidate runs.
pub fn run_optimization(
    optimization: &settings::OptimizationSettings,
    runner: &dyn CandidateRunner,
    pool: &dyn WorkPool,
    sink: &OptimizationSink,
    stop: &context::StopHandle,
) -> BridgeResult<OptimizationSummary> {
    let params = optimization.resolve_params()?;
    if params.is_empty() {
        return Err(BridgeError::NoOptimizationParams);
    }

    let summary = match &optimization.optimizer_type {
        settings::OptimizerType::BruteForce => OptimizationSummary {
            evaluations: BruteForceOptimizer::new(params)?.run(runner, pool, sink, stop)?,
            generations: Vec::new(),
        },
        settings::OptimizerType::Genetic { ga_params } => {
            let report = GeneticOptimizer::new(params, ga_params.clone(), optimization.optimization_goal)?
                .run(runner, pool, sink, stop)?;
            OptimizationSummary {
                evaluations: report.evaluations,
                generations: report.generations,
            }
        }
    };
    sink.flush()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(start: f64, step: f64, stop: f64) -> OptimizationParam {
        OptimizationParam::new(native::settings_index::TIMED_EXIT_BARS, start, step, stop)
    }

    /// Fitness peaks at value 7 of slot TIMED_EXIT_BARS.
    fn peak_runner() -> impl CandidateRunner {
        |parameters: &ParameterSet, _worker: usize| -> BridgeResult<statistics::TestResult> {
            let x = parameters.get_values()[0].1;
            Ok(statistics::TestResult {
                final_balance: 10_000.0 - (x - 7.0).powi(2),
                initial_balance: 10_000.0,
                total_trades: 10,
                ..Default::default()
            })
        }
    }

    fn ga_params(seed: u64) -> settings::GAParams {
        settings::GAParams {
            population_size: 8,
            max_generations: 6,
            crossover_probability: 0.8,
            mutation_probability: 0.3,
            migration_probability: 0.5,
            islands: 2,
            elitism: true,
            crossover_mode: settings::CrossoverMode::Uniform,
            mutation_mode: settings::MutationMode::Step,
            stop_if_converged: false,
            min_trades_a_year: 0.0,
            seed: Some(seed),
        }
    }

    #[test]
    fn test_param_values_inclusive() {
        assert_eq!(param(0.0, 1.0, 3.0).values(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(param(0.1, 0.1, 0.3).values().len(), 3);
        assert_eq!(param(5.0, 1.0, 5.0).values(), vec![5.0]);
    }

    #[test]
    fn test_grid_is_cartesian() {
        let params = vec![
            param(0.0, 1.0, 2.0),
            OptimizationParam::new(native::settings_index::MAX_SPREAD, 1.0, 1.0, 2.0),
        ];
        let grid = generate_all_combinations(&params);
        assert_eq!(grid.len(), 6);
        assert_eq!(calculate_total_combinations(&params), 6);
        assert!(grid.contains(&ParameterSet::new().with_values(vec![
            (native::settings_index::TIMED_EXIT_BARS, 2.0),
            (native::settings_index::MAX_SPREAD, 1.0),
        ])));
    }

    #[test]
    fn test_zero_params_rejected() {
        assert!(matches!(BruteForceOptimizer::new(Vec::new()), Err(BridgeError::NoOptimizationParams)));
        assert!(matches!(
            GeneticOptimizer::new(Vec::new(), ga_params(1), settings::OptimizationGoal::Profit),
            Err(BridgeError::NoOptimizationParams)
        ));
    }

    #[test]
    fn test_brute_force_records_each_candidate_once() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in_callback = seen.clone();
        let sink = OptimizationSink::new(settings::OptimizationGoal::Profit)
            .with_callback(move |event| seen_in_callback.lock().unwrap().push(event.iteration));

        let optimizer = BruteForceOptimizer::new(vec![param(0.0, 1.0, 3.0)]).unwrap();
        let results = optimizer
            .run(&peak_runner(), &LocalPool::new(2), &sink, &context::StopHandle::new())
            .unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(sink.get_iterations(), 4);
    }

    #[test]
    fn test_stop_skips_remaining_candidates() {
        let stop = context::StopHandle::new();
        stop.request_stop();
        let sink = OptimizationSink::new(settings::OptimizationGoal::Profit);
        let optimizer = BruteForceOptimizer::new(vec![param(0.0, 1.0, 9.0)]).unwrap();
        let results = optimizer.run(&peak_runner(), &LocalPool::new(1), &sink, &stop).unwrap();
        assert!(results.is_empty());
        assert_eq!(sink.get_iterations(), 0);
    }

    #[test]
    fn test_genetic_finds_peak_without_reevaluating() {
        let (sender, receiver) = std::sync::mpsc::channel();
        let sink = OptimizationSink::new(settings::OptimizationGoal::Profit).with_channel(sender);
        let optimizer = GeneticOptimizer::new(
            vec![param(0.0, 1.0, 10.0)],
            ga_params(42),
            settings::OptimizationGoal::Profit,
        )
        .unwrap();

        let report = optimizer
            .run(&peak_runner(), &LocalPool::new(2), &sink, &context::StopHandle::new())
            .unwrap();
        drop(sink);

        let events: Vec<OptimizationEvent> = receiver.iter().collect();
        assert_eq!(events.len(), report.evaluations.len());
        // the cache keeps each genome to a single evaluation
        let mut values: Vec<i64> = events.iter().map(|e| e.parameters.get_values()[0].1 as i64).collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), events.len());
        assert!(events.len() <= 11);

        let best = report.best(settings::OptimizationGoal::Profit).unwrap();
        assert!(report.evaluations.iter().all(|r| r.get_fitness() <= best.get_fitness()));
        assert_eq!(report.generations.len(), 6);
    }

    #[test]
    fn test_stop_during_generation_finishes_it() {
        let stop = context::StopHandle::new();
        let stop_in_callback = stop.clone();
        let sink = OptimizationSink::new(settings::OptimizationGoal::Profit)
            .with_callback(move |_event| stop_in_callback.request_stop());
        let mut params = ga_params(7);
        params.islands = 1;
        let optimizer =
            GeneticOptimizer::new(vec![param(0.0, 1.0, 100.0)], params, settings::OptimizationGoal::Profit).unwrap();

        let report = optimizer.run(&peak_runner(), &LocalPool::new(1), &sink, &stop).unwrap();

        let mut distinct: Vec<i64> = report
            .evaluations
            .iter()
            .map(|r| r.get_parameters().get_values()[0].1 as i64)
            .collect();
        distinct.sort_unstable();
        distinct.dedup();
        assert!(stop.is_stop_requested());
        assert_eq!(report.generations.len(), 1);
        assert_eq!(report.evaluations.len(), distinct.len());
        assert!(report.evaluations.len() > 1);
        assert_eq!(sink.get_iterations(), report.evaluations.len());
    }

    #[test]
    fn test_min_trades_penalizes_candidate() {
        let mut params = ga_params(3);
        params.min_trades_a_year = 50.0;
        let optimizer =
            GeneticOptimizer::new(vec![param(0.0, 1.0, 1.0)], params, settings::OptimizationGoal::Profit).unwrap();
        let result = statistics::TestResult {
            total_trades: 10,
            years_traded: 1.0,
            ..Default::default()
        };
        assert_eq!(optimizer.score(&result).0, f64::NEG_INFINITY);
    }

    #[test]
    fn test_minimized_goal_score() {
        assert!(goal_score(settings::OptimizationGoal::MaxDd, 5.0) > goal_score(settings::OptimizationGoal::MaxDd, 10.0));
        assert!(goal_score(settings::OptimizationGoal::Sharpe, 2.0) > goal_score(settings::OptimizationGoal::Sharpe, 1.0));
    }
}
