// asirikuy_core/src/report.rs

//! Report writers: closed trades, balance curves, optimization rows and the
//! JSON dump of a `TestResult`.

use crate::error::BridgeResult;
use crate::optimization;
use crate::orders;
use crate::statistics;
use crate::utils;

use std::io::Write;

/// One row of the trade list.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TradeRecord {
    pub ticket: i64,
    pub side: &'static str,
    pub open_time: String,
    pub close_time: String,
    pub open_price: f64,
    pub close_price: f64,
    pub lots: f64,
    pub profit: f64,
    pub sl: f64,
    pub tp: f64,
    pub balance: f64,
    pub instance_id: i32,
    pub symbol: String,
    pub swap: f64,
}

/// Closed orders of one instance, with the balance after each close.
pub fn trade_records(symbol: &str, initial_balance: f64, closed: &[orders::OrderInfo]) -> Vec<TradeRecord> {
    let mut balance = initial_balance;
    closed
        .iter()
        .map(|order| {
            balance += order.profit;
            TradeRecord {
                ticket: order.ticket,
                side: order.order_type.label(),
                open_time: utils::format_timestamp(order.open_time),
                close_time: utils::format_timestamp(order.close_time),
                open_price: order.open_price,
                close_price: order.close_price,
                lots: order.lots,
                profit: order.profit,
                sl: order.stop_loss,
                tp: order.take_profit,
                balance,
                instance_id: order.instance_id,
                symbol: symbol.to_string(),
                swap: order.swap,
            }
        })
        .collect()
}

/// Writes trade records sorted by close time, then ticket.
pub fn write_trades_csv<P: AsRef<std::path::Path>>(path: P, records: &[TradeRecord]) -> BridgeResult<()> {
    let mut sorted: Vec<&TradeRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.close_time.cmp(&b.close_time).then(a.ticket.cmp(&b.ticket)));

    let mut writer = csv::WriterBuilder::new().delimiter(b',').from_path(path)?;
    for record in sorted {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Balance curve as `datetime;balance`.
pub fn export_balance_to_csv<P: AsRef<std::path::Path>>(path: P, curve: &[statistics::BalancePoint]) -> BridgeResult<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    writeln!(file, "datetime;balance")?;
    for point in curve {
        writeln!(file, "{};{:.2}", utils::format_timestamp(point.time), point.balance)?;
    }
    file.flush()?;
    Ok(())
}

pub fn write_result_json<P: AsRef<std::path::Path>>(path: P, result: &statistics::TestResult) -> BridgeResult<()> {
    let file = std::io::BufWriter::new(std::fs::File::create(path)?);
    serde_json::to_writer_pretty(file, result).map_err(std::io::Error::from)?;
    Ok(())
}

/// Fixed result columns of the optimization file.
fn result_columns(result: &statistics::TestResult) -> Vec<(&'static str, String)> {
    vec![
        ("Total_Trades", result.total_trades.to_string()),
        ("Final_Balance", format!("{:.2}", result.final_balance)),
        ("Max_DD", format!("{:.2}", result.max_dd_depth)),
        ("Max_DD_%", format!("{:.4}", result.max_dd_percent)),
        ("Max_DD_Length", result.max_dd_length.to_string()),
        ("Profit_Factor", format!("{:.4}", result.profit_factor)),
        ("R2", format!("{:.4}", result.r2)),
        ("Ulcer_Index", format!("{:.4}", result.ulcer_index)),
        ("Sharpe", format!("{:.4}", result.sharpe)),
        ("CAGR", format!("{:.4}", result.cagr)),
        ("CAGR/Max_DD", format!("{:.4}", result.cagr_to_max_dd)),
        ("Failure", result.failure.clone().unwrap_or_default()),
    ]
}

/// Semicolon-separated optimization results, one row per evaluation.
/// The header is written with the first row, once the parameter slots are known.
pub struct OptimizationWriter {
    writer: csv::Writer<std::fs::File>,
    header_written: bool,
}

impl OptimizationWriter {
    pub fn create<P: AsRef<std::path::Path>>(path: P) -> BridgeResult<Self> {
        let writer = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;
        Ok(Self {
            writer,
            header_written: false,
        })
    }

    pub fn write_row(
        &mut self,
        iteration: usize,
        parameters: &optimization::ParameterSet,
        result: &statistics::TestResult,
    ) -> BridgeResult<()> {
        let columns = result_columns(result);

        if !self.header_written {
            let mut header = vec!["Iteration".to_string()];
            header.extend(parameters.get_values().iter().map(|(index, _)| crate::native::settings_index::name(*index)));
            header.extend(columns.iter().map(|(name, _)| name.to_string()));
            self.writer.write_record(&header)?;
            self.header_written = true;
        }

        let mut row = vec![iteration.to_string()];
        row.extend(parameters.get_values().iter().map(|(_, value)| value.to_string()));
        row.extend(columns.into_iter().map(|(_, value)| value));
        self.writer.write_record(&row)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> BridgeResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(ticket: i64, profit: f64, close_time: i64) -> orders::OrderInfo {
        orders::OrderInfo {
            ticket,
            instance_id: 3,
            order_type: orders::OrderType::Buy,
            open_time: close_time - 60,
            close_time,
            stop_loss: 0.0,
            take_profit: 0.0,
            expiration: 0,
            open_price: 1.1,
            close_price: 1.1 + profit / 100_000.0,
            lots: 1.0,
            profit,
            commission: 0.0,
            swap: 0.0,
            is_open: false,
        }
    }

    #[test]
    fn test_trade_records_running_balance() {
        let records = trade_records("EURUSD", 1_000.0, &[closed(1, 50.0, 120), closed(2, -20.0, 240)]);
        assert_eq!(records[0].balance, 1_050.0);
        assert_eq!(records[1].balance, 1_030.0);
        assert_eq!(records[1].symbol, "EURUSD");
    }

    #[test]
    fn test_trades_csv_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        write_trades_csv(&path, &trade_records("EURUSD", 1_000.0, &[closed(1, 50.0, 120)])).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "ticket,side,open_time,close_time,open_price,close_price,lots,profit,sl,tp,balance,instance_id,symbol,swap"
        );
        assert!(lines.next().unwrap().starts_with("1,buy,1970-01-01 00:01:00,1970-01-01 00:02:00"));
    }

    #[test]
    fn test_balance_csv_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balance.csv");
        let curve = vec![
            statistics::BalancePoint { time: 0, balance: 1_000.0 },
            statistics::BalancePoint { time: 3_600, balance: 1_012.5 },
        ];
        export_balance_to_csv(&path, &curve).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "datetime;balance\n1970-01-01 00:00:00;1000.00\n1970-01-01 01:00:00;1012.50\n");
    }

    #[test]
    fn test_optimization_writer_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.csv");
        let mut writer = OptimizationWriter::create(&path).unwrap();
        let parameters = optimization::ParameterSet::new().with_values(vec![(0, 1.0)]);
        writer.write_row(1, &parameters, &statistics::TestResult::default()).unwrap();
        writer.write_row(2, &parameters, &statistics::TestResult::default()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Iteration;ADDITIONAL_PARAM_1;Total_Trades"));
        assert!(lines[2].starts_with("2;1;0"));
    }

    #[test]
    fn test_result_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        let result = statistics::TestResult {
            symbol: "EURUSD".to_string(),
            total_trades: 3,
            ..Default::default()
        };
        write_result_json(&path, &result).unwrap();
        let loaded: statistics::TestResult = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, result);
    }
}
