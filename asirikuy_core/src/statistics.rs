// asirikuy_core/src/statistics.rs

//! Statistics Accumulator.
//! Consumes closed trades in time order, keeps the balance curve and running drawdown,
//! and derives the final `TestResult` in one pass over the curve.

use crate::orders;
use crate::settings;

const SECONDS_PER_YEAR: f64 = 365.25 * 86_400.0;
const SECONDS_PER_WEEK: i64 = 604_800;
/// sqrt(52): weekly Sharpe to annual.
const ANNUALIZE_WEEKLY: f64 = 7.211_110_3;
const ULCER_CAP: f64 = 100.0;

/// One point of a balance curve.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BalancePoint {
    pub time: i64,
    pub balance: f64,
}

/// Aggregate outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TestResult {
    pub symbol: String,
    pub total_trades: usize,
    pub num_longs: usize,
    pub num_shorts: usize,
    pub initial_balance: f64,
    pub final_balance: f64,
    /// Largest peak-to-trough decline, account currency.
    pub max_dd_depth: f64,
    /// Same decline in percent of the peak (of the initial balance without compounding).
    pub max_dd_percent: f64,
    /// Longest time below a prior peak, seconds.
    pub max_dd_length: i64,
    pub profit_factor: f64,
    pub r2: f64,
    pub ulcer_index: f64,
    pub sharpe: f64,
    /// Percent per year.
    pub cagr: f64,
    pub cagr_to_max_dd: f64,
    pub martin: f64,
    pub winning_percent: f64,
    pub risk_reward: f64,
    /// Seconds.
    pub avg_trade_duration: f64,
    pub years_traded: f64,
    pub bars_processed: usize,
    /// Error that ended the run early, if any.
    pub failure: Option<String>,
}

impl TestResult {
    /// Converts the result into key-value pairs for display.
    pub fn to_stats_list(&self) -> Vec<(String, String)> {
        let mut stats = Vec::new();

        stats.push(("Symbol".to_string(), self.symbol.clone()));
        stats.push(("Total_Trades".to_string(), self.total_trades.to_string()));
        stats.push(("Longs".to_string(), self.num_longs.to_string()));
        stats.push(("Shorts".to_string(), self.num_shorts.to_string()));
        stats.push(("Final_Balance".to_string(), format!("{:.2}", self.final_balance)));
        stats.push(("Max_DD".to_string(), format!("{:.2}", self.max_dd_depth)));
        stats.push(("Max_DD_%".to_string(), format!("{:.2}", self.max_dd_percent)));
        stats.push(("Max_DD_Length_days".to_string(), format!("{:.1}", self.max_dd_length as f64 / 86_400.0)));
        stats.push(("Profit_Factor".to_string(), format!("{:.3}", self.profit_factor)));
        stats.push(("R2".to_string(), format!("{:.4}", self.r2)));
        stats.push(("Ulcer_Index".to_string(), format!("{:.3}", self.ulcer_index)));
        stats.push(("Sharpe".to_string(), format!("{:.3}", self.sharpe)));
        stats.push(("CAGR_%".to_string(), format!("{:.3}", self.cagr)));
        stats.push(("CAGR/Max_DD".to_string(), format!("{:.3}", self.cagr_to_max_dd)));
        stats.push(("Martin".to_string(), format!("{:.3}", self.martin)));
        stats.push(("Winning_%".to_string(), format!("{:.2}", self.winning_percent)));
        stats.push(("Risk_Reward".to_string(), format!("{:.3}", self.risk_reward)));
        stats.push(("Avg_Trade_Duration_h".to_string(), format!("{:.2}", self.avg_trade_duration / 3600.0)));
        stats.push(("Years_Traded".to_string(), format!("{:.3}", self.years_traded)));
        stats.push(("Bars_Processed".to_string(), self.bars_processed.to_string()));
        if let Some(failure) = &self.failure {
            stats.push(("Failure".to_string(), failure.clone()));
        }

        stats
    }

    pub fn trades_per_year(&self) -> f64 {
        if self.years_traded > 0.0 {
            self.total_trades as f64 / self.years_traded
        } else {
            0.0
        }
    }

    /// Metric an optimization ranks candidates by.
    pub fn goal_value(&self, goal: settings::OptimizationGoal) -> f64 {
        match goal {
            settings::OptimizationGoal::Profit => self.final_balance - self.initial_balance,
            settings::OptimizationGoal::MaxDd => self.max_dd_percent,
            settings::OptimizationGoal::MaxDdLength => self.max_dd_length as f64,
            settings::OptimizationGoal::ProfitFactor => self.profit_factor,
            settings::OptimizationGoal::R2 => self.r2,
            settings::OptimizationGoal::UlcerIndex => self.ulcer_index,
            settings::OptimizationGoal::Sharpe => self.sharpe,
            settings::OptimizationGoal::CagrToMaxDd => self.cagr_to_max_dd,
            settings::OptimizationGoal::Cagr => self.cagr,
        }
    }
}

/// A realized trade as the accumulator sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ClosedTrade {
    time: i64,
    profit: f64,
    metric_profit: f64,
    balance: f64,
    metric_balance: f64,
}

pub struct StatisticsAccumulator {
    initial_balance: f64,
    options: settings::StatisticsSettings,
    start_time: Option<i64>,
    end_time: i64,
    balance: f64,
    metric_balance: f64,
    trades: Vec<ClosedTrade>,
    peak: f64,
    dd_start: i64,
    in_drawdown: bool,
    max_dd_depth: f64,
    max_dd_percent: f64,
    max_dd_length: i64,
}

impl StatisticsAccumulator {
    pub fn new(initial_balance: f64, options: settings::StatisticsSettings) -> Self {
        Self {
            initial_balance,
            options,
            start_time: None,
            end_time: 0,
            balance: initial_balance,
            metric_balance: initial_balance,
            trades: Vec::new(),
            peak: initial_balance,
            dd_start: 0,
            in_drawdown: false,
            max_dd_depth: 0.0,
            max_dd_percent: 0.0,
            max_dd_length: 0,
        }
    }

    /// Marks simulated time; the first call fixes the curve start.
    pub fn record_time(&mut self, time: i64) {
        if self.start_time.is_none() {
            self.start_time = Some(time);
            self.dd_start = time;
        }
        self.end_time = self.end_time.max(time);
    }

    /// Feeds every close found in a slice of the signal stream.
    pub fn record_signals(&mut self, signals: &[orders::TradeSignal]) {
        for signal in signals.iter().filter(|s| s.kind.is_close()) {
            self.record_close(signal.time, signal.profit, signal.gross_profit);
        }
    }

    /// Adds one realized trade.
    /// # Arguments
    /// * `time` - Close time.
    /// * `profit` - Realized profit including swap and commission.
    /// * `gross_profit` - Price-driven profit only.
    pub fn record_close(&mut self, time: i64, profit: f64, gross_profit: f64) {
        self.record_time(time);
        self.balance += profit;
        let metric_profit = if self.options.include_costs_in_metrics { profit } else { gross_profit };
        self.metric_balance += metric_profit;

        self.trades.push(ClosedTrade {
            time,
            profit,
            metric_profit,
            balance: self.balance,
            metric_balance: self.metric_balance,
        });
        self.update_drawdown(time, self.balance);
    }

    fn update_drawdown(&mut self, time: i64, balance: f64) {
        if balance < self.peak {
            let depth = self.peak - balance;
            let base = if self.options.disable_compounding { self.initial_balance } else { self.peak };
            let percent = if base > 0.0 { (depth / base * 100.0).min(100.0) } else { 100.0 };
            self.max_dd_depth = self.max_dd_depth.max(depth);
            self.max_dd_percent = self.max_dd_percent.max(percent);
            self.max_dd_length = self.max_dd_length.max(time - self.dd_start);
        } else {
            // recovery closes the drawdown opened at dd_start
            if self.in_drawdown {
                self.max_dd_length = self.max_dd_length.max(time - self.dd_start);
            }
            self.peak = balance;
            self.dd_start = time;
        }
        self.in_drawdown = balance < self.peak;
    }

    pub fn get_balance(&self) -> f64 {
        self.balance
    }

    /// Start point, one point per close, end point.
    pub fn balance_curve(&self) -> Vec<BalancePoint> {
        let Some(start) = self.start_time else {
            return Vec::new();
        };
        let mut curve = Vec::with_capacity(self.trades.len() + 2);
        curve.push(BalancePoint { time: start, balance: self.initial_balance });
        curve.extend(self.trades.iter().map(|t| BalancePoint { time: t.time, balance: t.balance }));
        curve.push(BalancePoint { time: self.end_time, balance: self.balance });
        curve
    }

    /// Computes every metric.
    pub fn finish(&self, symbol: &str, counters: orders::TradeCounters, avg_trade_duration: f64, bars_processed: usize) -> TestResult {
        let start = self.start_time.unwrap_or(self.end_time);
        let elapsed = (self.end_time - start).max(0) as f64;
        let years_traded = elapsed / SECONDS_PER_YEAR;

        // open drawdown at the end of the run still counts towards its length
        let max_dd_length = if self.balance < self.peak {
            self.max_dd_length.max(self.end_time - self.dd_start)
        } else {
            self.max_dd_length
        };

        let (profit_factor, winning_percent, risk_reward) = self.trade_ratios();
        let r2 = self.r_squared(start);
        let (sharpe, ulcer_index) = self.weekly_ratios(start);

        let cagr = if years_traded <= 0.0 {
            0.0
        } else if self.balance <= 0.0 {
            -100.0
        } else {
            100.0 * ((self.balance / self.initial_balance).powf(1.0 / years_traded) - 1.0)
        };
        let cagr_to_max_dd = if self.max_dd_percent > 0.0 { cagr / self.max_dd_percent } else { 0.0 };
        let martin = if ulcer_index > 0.0 { cagr / ulcer_index } else { 0.0 };

        TestResult {
            symbol: symbol.to_string(),
            total_trades: counters.total_trades,
            num_longs: counters.num_longs,
            num_shorts: counters.num_shorts,
            initial_balance: self.initial_balance,
            final_balance: self.balance,
            max_dd_depth: self.max_dd_depth,
            max_dd_percent: self.max_dd_percent,
            max_dd_length,
            profit_factor,
            r2,
            ulcer_index,
            sharpe,
            cagr,
            cagr_to_max_dd,
            martin,
            winning_percent,
            risk_reward,
            avg_trade_duration,
            years_traded,
            bars_processed,
            failure: None,
        }
    }

    /// Profit factor, winning percentage and risk/reward. PF is 0 without losses.
    fn trade_ratios(&self) -> (f64, f64, f64) {
        let (mut total_win, mut total_loss) = (0.0, 0.0);
        let (mut wins, mut losses) = (0usize, 0usize);
        let (mut avg_win, mut avg_loss) = (0.0, 0.0);

        for trade in &self.trades {
            let relative = if trade.balance != 0.0 { (trade.profit / trade.balance).abs() } else { 0.0 };
            if trade.metric_profit == 0.0 {
                continue;
            }
            if trade.metric_profit > 0.0 {
                total_win += trade.metric_profit;
                wins += 1;
                avg_win += (relative - avg_win) / wins as f64;
            } else {
                total_loss += trade.metric_profit.abs();
                losses += 1;
                avg_loss += (relative - avg_loss) / losses as f64;
            }
        }

        let profit_factor = if total_loss > 0.0 { total_win / total_loss } else { 0.0 };
        // break-even trades are neither wins nor losses
        let decided = wins + losses;
        let winning_percent = if decided > 0 { wins as f64 / decided as f64 * 100.0 } else { 0.0 };
        let risk_reward = if avg_loss > 0.0 { avg_win / avg_loss } else { 0.0 };
        (profit_factor, winning_percent, risk_reward)
    }

    /// Fit of the curve to a line through its first point. Log-balance unless
    /// compounding is disabled or a balance is not positive.
    fn r_squared(&self, start: i64) -> f64 {
        let mut points: Vec<(f64, f64)> = Vec::with_capacity(self.trades.len() + 1);
        points.push((0.0, self.initial_balance));
        points.extend(self.trades.iter().map(|t| ((t.time - start) as f64, t.balance)));
        if points.len() < 3 {
            return 0.0;
        }

        let use_log = !self.options.disable_compounding && points.iter().all(|(_, b)| *b > 0.0);
        let origin = if use_log { self.initial_balance.ln() } else { self.initial_balance };
        let ys: Vec<f64> = points
            .iter()
            .map(|(_, b)| if use_log { b.ln() - origin } else { b - origin })
            .collect();

        let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
        if sum_xx == 0.0 {
            return 0.0;
        }
        let sum_xy: f64 = points.iter().zip(&ys).map(|((x, _), y)| x * y).sum();
        let slope = sum_xy / sum_xx;
        let mean_y = ys.iter().sum::<f64>() / ys.len() as f64;

        let residual: f64 = points.iter().zip(&ys).map(|((x, _), y)| (slope * x - y).powi(2)).sum();
        let total: f64 = ys.iter().map(|y| (y - mean_y).powi(2)).sum();
        if total == 0.0 {
            return 0.0;
        }
        let r2 = 1.0 - residual / total;
        if r2.is_finite() { r2.clamp(0.0, 1.0) } else { 0.0 }
    }

    /// Sharpe and Ulcer Index on the curve resampled to whole weeks from the start.
    fn weekly_ratios(&self, start: i64) -> (f64, f64) {
        let mut weeks = 0usize;
        let mut analysis_time = start;
        let mut index = 0;
        let (mut sum, mut sum_sq, mut ulcer_sum) = (0.0, 0.0, 0.0);
        let mut max_balance = self.initial_balance;
        let mut week_start = (self.initial_balance, self.initial_balance);
        let mut week_end = week_start;

        while analysis_time < self.end_time {
            weeks += 1;
            analysis_time += SECONDS_PER_WEEK;
            while index < self.trades.len() && self.trades[index].time < analysis_time {
                week_end = (self.trades[index].balance, self.trades[index].metric_balance);
                index += 1;
            }

            let base = if self.options.disable_compounding { self.initial_balance } else { week_start.1 };
            let week_return = if base != 0.0 { (week_end.1 - week_start.1) / base } else { 0.0 };
            sum += week_return;
            sum_sq += week_return * week_return;
            week_start = week_end;

            if week_end.0 > max_balance {
                max_balance = week_end.0;
            } else if max_balance > 0.0 {
                ulcer_sum += (100.0 * (week_end.0 / max_balance - 1.0)).powi(2);
            }
        }

        if weeks == 0 {
            return (0.0, 0.0);
        }
        let n = weeks as f64;
        let ulcer = (ulcer_sum / n).sqrt().min(ULCER_CAP);

        let sharpe = if weeks < 2 {
            0.0
        } else {
            let variance = (n * sum_sq - sum * sum) / (n * (n - 1.0));
            let sigma = variance.max(0.0).sqrt();
            if sigma > 0.0 { ANNUALIZE_WEEKLY * (sum / n) / sigma } else { 0.0 }
        };
        (sharpe, ulcer)
    }
}
