// asirikuy_core/src/orders.rs

//! Order Book Mirror.
//! Host-side ledger of one instance's orders, kept in lockstep with what the engine
//! believes after every signal. Also settles pending fills, SL/TP hits and swap.

use crate::error::{BridgeError, BridgeResult};
use crate::native;
use crate::rates;
use crate::settings;
use crate::utils;

/// Order types with the framework's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum OrderType {
    Buy = 0,
    Sell = 1,
    BuyLimit = 2,
    SellLimit = 3,
    BuyStop = 4,
    SellStop = 5,
}

impl OrderType {
    pub fn from_code(code: f64) -> Option<Self> {
        match code as i32 {
            0 => Some(Self::Buy),
            1 => Some(Self::Sell),
            2 => Some(Self::BuyLimit),
            3 => Some(Self::SellLimit),
            4 => Some(Self::BuyStop),
            5 => Some(Self::SellStop),
            _ => None,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Self::Buy | Self::BuyLimit | Self::BuyStop)
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, Self::Buy | Self::Sell)
    }

    pub fn direction(&self) -> f64 {
        if self.is_buy() { 1.0 } else { -1.0 }
    }

    /// Market type a pending order turns into when filled.
    pub fn filled(&self) -> Self {
        if self.is_buy() { Self::Buy } else { Self::Sell }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::BuyLimit => "buylimit",
            Self::SellLimit => "selllimit",
            Self::BuyStop => "buystop",
            Self::SellStop => "sellstop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Open,
    Close,
    Update,
}

const BUY_SIDE: [OrderType; 3] = [OrderType::Buy, OrderType::BuyLimit, OrderType::BuyStop];
const SELL_SIDE: [OrderType; 3] = [OrderType::Sell, OrderType::SellLimit, OrderType::SellStop];

/// Bit of the results signal word for an action on an order type.
pub fn signal_flag(order_type: OrderType, action: SignalAction) -> u32 {
    use native::signal_flags::*;
    match (order_type, action) {
        (OrderType::Buy, SignalAction::Open) => OPEN_BUY,
        (OrderType::Buy, SignalAction::Close) => CLOSE_BUY,
        (OrderType::Buy, SignalAction::Update) => UPDATE_BUY,
        (OrderType::BuyLimit, SignalAction::Open) => OPEN_BUYLIMIT,
        (OrderType::BuyLimit, SignalAction::Close) => CLOSE_BUYLIMIT,
        (OrderType::BuyLimit, SignalAction::Update) => UPDATE_BUYLIMIT,
        (OrderType::BuyStop, SignalAction::Open) => OPEN_BUYSTOP,
        (OrderType::BuyStop, SignalAction::Close) => CLOSE_BUYSTOP,
        (OrderType::BuyStop, SignalAction::Update) => UPDATE_BUYSTOP,
        (OrderType::Sell, SignalAction::Open) => OPEN_SELL,
        (OrderType::Sell, SignalAction::Close) => CLOSE_SELL,
        (OrderType::Sell, SignalAction::Update) => UPDATE_SELL,
        (OrderType::SellLimit, SignalAction::Open) => OPEN_SELLLIMIT,
        (OrderType::SellLimit, SignalAction::Close) => CLOSE_SELLLIMIT,
        (OrderType::SellLimit, SignalAction::Update) => UPDATE_SELLLIMIT,
        (OrderType::SellStop, SignalAction::Open) => OPEN_SELLSTOP,
        (OrderType::SellStop, SignalAction::Close) => CLOSE_SELLSTOP,
        (OrderType::SellStop, SignalAction::Update) => UPDATE_SELLSTOP,
    }
}

/// Kind of entry in the trade signal stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SignalKind {
    Open,
    Fill,
    Modify,
    Close,
    StopLoss,
    TakeProfit,
    Cancel,
}

impl SignalKind {
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close | Self::StopLoss | Self::TakeProfit)
    }
}

/// One applied event, in bar order.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TradeSignal {
    pub time: i64,
    pub instance_id: i32,
    pub ticket: i64,
    pub kind: SignalKind,
    pub order_type: OrderType,
    pub price: f64,
    pub lots: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Realized profit for closes, 0 otherwise.
    pub profit: f64,
    /// Price-driven part of `profit`, before swap and commission.
    pub gross_profit: f64,
    pub balance: f64,
}

/// Host mirror of a native order record.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct OrderInfo {
    pub ticket: i64,
    pub instance_id: i32,
    pub order_type: OrderType,
    pub open_time: i64,
    pub close_time: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub expiration: i64,
    pub open_price: f64,
    pub close_price: f64,
    pub lots: f64,
    pub profit: f64,
    pub commission: f64,
    pub swap: f64,
    pub is_open: bool,
}

impl OrderInfo {
    pub fn to_c(&self) -> native::COrderInfo {
        native::COrderInfo {
            ticket: self.ticket as f64,
            instance_id: self.instance_id as f64,
            order_type: self.order_type as i32 as f64,
            open_time: self.open_time as f64,
            close_time: self.close_time as f64,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            expiration: self.expiration as f64,
            open_price: self.open_price,
            close_price: self.close_price,
            lots: self.lots,
            profit: self.profit,
            commission: self.commission,
            swap: self.swap,
            is_open: if self.is_open { 1.0 } else { 0.0 },
        }
    }
}

/// Market state the book settles against on one bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub time: i64,
    pub bid: f64,
    pub ask: f64,
    /// Term currency -> account currency factor.
    pub conversion: f64,
    /// Last fully closed bar of the traded symbol.
    pub last_bar: Option<rates::Rate>,
}

/// Open-trade counters; pending orders cancelled before filling are taken back out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TradeCounters {
    pub total_trades: usize,
    pub num_longs: usize,
    pub num_shorts: usize,
}

const SWAP_INTERVAL_SECS: i64 = 3600;
const WEDNESDAY: u32 = 3;

pub struct OrderBook {
    instance_id: i32,
    account: settings::AccountSettings,
    max_open_orders: usize,
    initial_balance: f64,
    balance: f64,
    next_ticket: i64,
    open: Vec<OrderInfo>,
    closed: Vec<OrderInfo>,
    signals: Vec<TradeSignal>,
    counters: TradeCounters,
    last_swap_time: i64,
    total_trade_duration: f64,
    market_closes: usize,
}

impl OrderBook {
    pub fn new(
        instance_id: i32,
        account: settings::AccountSettings,
        initial_balance: f64,
        max_open_orders: usize,
    ) -> Self {
        Self {
            instance_id,
            account,
            max_open_orders: max_open_orders.max(1),
            initial_balance,
            balance: initial_balance,
            next_ticket: 1,
            open: Vec::new(),
            closed: Vec::new(),
            signals: Vec::new(),
            counters: TradeCounters::default(),
            last_swap_time: 0,
            total_trade_duration: 0.0,
            market_closes: 0,
        }
    }

    /// Applies one results vector. Each record is decoded in a fixed order:
    /// buy side opens, closes, updates, then the sell side likewise.
    pub fn apply_results(&mut self, results: &[native::StrategyResult], quote: &Quote) -> BridgeResult<()> {
        for result in results {
            let word = result.signal_word();
            if word == 0 {
                continue;
            }
            for side in [BUY_SIDE, SELL_SIDE] {
                for order_type in side {
                    if word & signal_flag(order_type, SignalAction::Open) != 0 {
                        self.open_order(order_type, result, quote)?;
                    }
                }
                for order_type in side {
                    if word & signal_flag(order_type, SignalAction::Close) != 0 {
                        self.close_orders(order_type, result.ticket(), quote)?;
                    }
                }
                for order_type in side {
                    if word & signal_flag(order_type, SignalAction::Update) != 0 {
                        self.modify_orders(order_type, result.ticket(), result, quote)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Opens a market or pending order. Returns the ticket, or `None` when the lot
    /// size rounds below the broker minimum.
    pub fn open_order(
        &mut self,
        order_type: OrderType,
        result: &native::StrategyResult,
        quote: &Quote,
    ) -> BridgeResult<Option<i64>> {
        let lots = utils::normalize_lots(result.lots, self.account.min_lot_size);
        if lots <= 0.0 {
            tracing::warn!(
                "Instance {}: {} lots below minimum lot size {}, order rejected",
                self.instance_id,
                result.lots,
                self.account.min_lot_size
            );
            return Ok(None);
        }
        if self.open.len() >= self.max_open_orders {
            return Err(BridgeError::MaxOpenOrdersExceeded {
                instance_id: self.instance_id,
                max: self.max_open_orders,
            });
        }

        let price = match order_type {
            OrderType::Buy => quote.ask,
            OrderType::Sell => quote.bid,
            _ if result.entry_price > 0.0 => result.entry_price,
            _ => {
                tracing::warn!("Instance {}: {} without entry price rejected", self.instance_id, order_type.label());
                return Ok(None);
            }
        };

        let direction = order_type.direction();
        let stop_loss = self.level_from_distance(price, -direction, result.broker_sl, "SL");
        let take_profit = self.level_from_distance(price, direction, result.broker_tp, "TP");

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let order = OrderInfo {
            ticket,
            instance_id: self.instance_id,
            order_type,
            open_time: quote.time,
            close_time: 0,
            stop_loss,
            take_profit,
            expiration: result.expiration_time.max(0.0) as i64,
            open_price: price,
            close_price: 0.0,
            lots,
            profit: 0.0,
            commission: self.account.commission_per_lot * lots,
            swap: 0.0,
            is_open: true,
        };

        self.counters.total_trades += 1;
        if order_type.is_buy() {
            self.counters.num_longs += 1;
        } else {
            self.counters.num_shorts += 1;
        }

        tracing::debug!(
            "Instance {}: open {} #{} {} lots @ {} sl {} tp {}",
            self.instance_id,
            order_type.label(),
            ticket,
            lots,
            price,
            stop_loss,
            take_profit
        );
        self.push_signal(&order, SignalKind::Open, quote.time, price, 0.0, 0.0);
        self.open.push(order);
        Ok(Some(ticket))
    }

    /// Absolute level `distance` away from `price` on `side` (+1 above, -1 below).
    /// Zero means unset; a distance under the broker minimum is refused.
    fn level_from_distance(&self, price: f64, side: f64, distance: f64, what: &str) -> f64 {
        if distance <= 0.0 {
            return 0.0;
        }
        if distance < self.account.minimum_stop {
            tracing::warn!(
                "Instance {}: {} distance {} below minimum stop {}, left unset",
                self.instance_id,
                what,
                distance,
                self.account.minimum_stop
            );
            return 0.0;
        }
        price + side * distance
    }

    fn matching(&self, order_type: OrderType, ticket: i64) -> BridgeResult<Vec<usize>> {
        let indices: Vec<usize> = self
            .open
            .iter()
            .enumerate()
            .filter(|(_, o)| o.order_type == order_type && (ticket == -1 || o.ticket == ticket))
            .map(|(i, _)| i)
            .collect();

        if indices.is_empty() && ticket != -1 {
            return Err(BridgeError::UnknownTicket {
                instance_id: self.instance_id,
                ticket,
            });
        }
        Ok(indices)
    }

    /// Closes one ticket or, with -1, every open order of the type.
    pub fn close_orders(&mut self, order_type: OrderType, ticket: i64, quote: &Quote) -> BridgeResult<()> {
        let mut indices = self.matching(order_type, ticket)?;
        indices.reverse();
        for index in indices {
            if order_type.is_pending() {
                self.cancel_pending(index, quote.time);
            } else {
                let price = if order_type.is_buy() { quote.bid } else { quote.ask };
                self.settle(index, price, quote, SignalKind::Close);
            }
        }
        Ok(())
    }

    /// Moves SL/TP of one ticket or every order of the type. Distances are taken from
    /// the current ask (buy) or bid (sell), or from the entry price of pending orders.
    pub fn modify_orders(
        &mut self,
        order_type: OrderType,
        ticket: i64,
        result: &native::StrategyResult,
        quote: &Quote,
    ) -> BridgeResult<()> {
        for index in self.matching(order_type, ticket)? {
            if order_type.is_pending() && result.entry_price > 0.0 {
                self.open[index].open_price = result.entry_price;
            }
            let base = match order_type {
                OrderType::Buy => quote.ask,
                OrderType::Sell => quote.bid,
                _ => self.open[index].open_price,
            };
            let direction = order_type.direction();
            let stop_loss = self.modified_level(base, -direction, result.broker_sl, self.open[index].stop_loss, "SL");
            let take_profit = self.modified_level(base, direction, result.broker_tp, self.open[index].take_profit, "TP");

            let order = &mut self.open[index];
            order.stop_loss = stop_loss;
            order.take_profit = take_profit;
            if result.expiration_time > 0.0 {
                order.expiration = result.expiration_time as i64;
            }
            let order = order.clone();
            self.push_signal(&order, SignalKind::Modify, quote.time, base, 0.0, 0.0);
        }
        Ok(())
    }

    fn modified_level(&self, base: f64, side: f64, distance: f64, current: f64, what: &str) -> f64 {
        if distance == 0.0 {
            return 0.0;
        }
        if distance < self.account.minimum_stop {
            tracing::warn!(
                "Instance {}: modified {} distance {} below minimum stop, kept {}",
                self.instance_id,
                what,
                distance,
                current
            );
            return current;
        }
        base + side * distance
    }

    fn cancel_pending(&mut self, index: usize, time: i64) {
        let mut order = self.open.remove(index);
        order.is_open = false;
        order.close_time = time;
        self.counters.total_trades = self.counters.total_trades.saturating_sub(1);
        if order.order_type.is_buy() {
            self.counters.num_longs = self.counters.num_longs.saturating_sub(1);
        } else {
            self.counters.num_shorts = self.counters.num_shorts.saturating_sub(1);
        }
        self.push_signal(&order, SignalKind::Cancel, time, order.open_price, 0.0, 0.0);
    }

    /// Price-driven profit of an order closed at `price`, in account currency.
    fn gross_profit(&self, order: &OrderInfo, price: f64, conversion: f64) -> f64 {
        (price - order.open_price) * order.lots * order.order_type.direction() * self.account.contract_size * conversion
    }

    /// Realizes an open market order into the balance.
    fn settle(&mut self, index: usize, price: f64, quote: &Quote, kind: SignalKind) {
        if quote.time < self.open[index].open_time {
            tracing::warn!(
                "Instance {}: close of #{} before its open time ignored",
                self.instance_id,
                self.open[index].ticket
            );
            return;
        }

        let mut order = self.open.remove(index);
        let gross = self.gross_profit(&order, price, quote.conversion);
        let profit = gross + order.swap - order.commission;

        order.is_open = false;
        order.close_time = quote.time;
        order.close_price = price;
        order.profit = profit;
        self.balance += profit;
        self.total_trade_duration += (order.close_time - order.open_time) as f64;
        self.market_closes += 1;

        tracing::debug!(
            "Instance {}: {:?} #{} @ {} profit {:.2} balance {:.2}",
            self.instance_id,
            kind,
            order.ticket,
            price,
            profit,
            self.balance
        );
        self.push_signal(&order, kind, quote.time, price, profit, gross);
        self.closed.push(order);
    }

    fn push_signal(&mut self, order: &OrderInfo, kind: SignalKind, time: i64, price: f64, profit: f64, gross_profit: f64) {
        self.signals.push(TradeSignal {
            time,
            instance_id: self.instance_id,
            ticket: order.ticket,
            kind,
            order_type: order.order_type,
            price,
            lots: order.lots,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            profit,
            gross_profit,
            balance: self.balance,
        });
    }

    /// Fills or expires pending orders against the last closed bar.
    pub fn check_pending(&mut self, quote: &Quote) {
        let Some(bar) = quote.last_bar else {
            return;
        };

        let mut index = 0;
        while index < self.open.len() {
            let order = &self.open[index];
            if !order.order_type.is_pending() {
                index += 1;
                continue;
            }
            if order.expiration > 0 && quote.time >= order.expiration {
                self.cancel_pending(index, quote.time);
                continue;
            }

            let filled = match order.order_type {
                OrderType::BuyLimit => bar.low < order.open_price,
                OrderType::BuyStop => bar.high > order.open_price,
                OrderType::SellLimit => bar.high > order.open_price,
                OrderType::SellStop => bar.low < order.open_price,
                _ => false,
            };
            if filled {
                let order = &mut self.open[index];
                order.order_type = order.order_type.filled();
                order.open_time = quote.time;
                let order = order.clone();
                tracing::debug!("Instance {}: pending #{} filled @ {}", self.instance_id, order.ticket, order.open_price);
                self.push_signal(&order, SignalKind::Fill, quote.time, order.open_price, 0.0, 0.0);
            }
            index += 1;
        }
    }

    /// Closes market orders whose SL or TP was touched by the last closed bar or
    /// the current price. The close is tagged take-profit when it made money.
    pub fn check_stops(&mut self, quote: &Quote) {
        let Some(bar) = quote.last_bar else {
            return;
        };
        let spread = (quote.ask - quote.bid).max(0.0);

        let mut index = 0;
        while index < self.open.len() {
            let order = &self.open[index];
            if order.order_type.is_pending() {
                index += 1;
                continue;
            }
            let (sl, tp) = (order.stop_loss, order.take_profit);

            let price = match order.order_type {
                OrderType::Buy if sl > 0.0 && (sl >= bar.low || sl >= quote.bid) => {
                    Some(if sl >= quote.bid && sl < bar.low { quote.bid } else { sl })
                }
                OrderType::Buy if tp > 0.0 && (tp <= bar.high || tp <= quote.bid) => Some(tp),
                OrderType::Sell if sl > 0.0 && (sl <= bar.high + spread || sl <= quote.ask) => {
                    Some(if sl <= quote.ask && sl > bar.high + spread { quote.ask } else { sl })
                }
                OrderType::Sell if tp > 0.0 && (tp >= bar.low + spread || tp >= quote.ask) => Some(tp),
                _ => None,
            };

            match price {
                Some(price) => {
                    let profit = self.gross_profit(order, price, quote.conversion) + order.swap - order.commission;
                    let kind = if profit > 0.0 { SignalKind::TakeProfit } else { SignalKind::StopLoss };
                    let before = self.open.len();
                    self.settle(index, price, quote, kind);
                    if self.open.len() == before {
                        index += 1;
                    }
                }
                None => index += 1,
            }
        }
    }

    /// Accrues swap on open market orders once more than an hour has passed since
    /// the last accrual. Wednesday accruals are tripled.
    pub fn accrue_swap(&mut self, time: i64) {
        if time - self.last_swap_time <= SWAP_INTERVAL_SECS {
            return;
        }
        let multiplier = if utils::weekday(time) == WEDNESDAY { 3.0 } else { 1.0 };
        let mut accrued = false;
        for order in self.open.iter_mut().filter(|o| !o.order_type.is_pending()) {
            let rate = if order.order_type.is_buy() { self.account.swap_long } else { self.account.swap_short };
            order.swap += rate * order.lots * multiplier;
            accrued = true;
        }
        if accrued {
            self.last_swap_time = time;
        }
    }

    /// Mark-to-market of open market orders, swap included.
    pub fn floating_profit(&self, quote: &Quote) -> f64 {
        self.open
            .iter()
            .filter(|o| !o.order_type.is_pending())
            .map(|o| {
                let price = if o.order_type.is_buy() { quote.bid } else { quote.ask };
                self.gross_profit(o, price, quote.conversion) + o.swap
            })
            .sum()
    }

    pub fn equity(&self, quote: &Quote) -> f64 {
        self.balance + self.floating_profit(quote)
    }

    pub fn margin(&self) -> f64 {
        self.open
            .iter()
            .filter(|o| !o.order_type.is_pending())
            .map(|o| o.lots * self.account.contract_size / self.account.leverage)
            .sum()
    }

    /// Realized profit of every closed order must equal the balance change.
    pub fn check_ledger(&self) -> BridgeResult<()> {
        let realized: f64 = self.closed.iter().map(|o| o.profit).sum();
        let expected = self.balance - self.initial_balance;
        let tolerance = 1e-6 * self.balance.abs().max(1.0);
        if (realized - expected).abs() > tolerance {
            return Err(BridgeError::LedgerMismatch {
                instance_id: self.instance_id,
                expected,
                actual: realized,
            });
        }
        Ok(())
    }

    /// Open orders in the layout the engine reads.
    pub fn open_orders_c(&self) -> Vec<native::COrderInfo> {
        self.open.iter().map(OrderInfo::to_c).collect()
    }

    pub fn get_instance_id(&self) -> i32 {
        self.instance_id
    }

    pub fn get_balance(&self) -> f64 {
        self.balance
    }

    pub fn get_initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn get_account(&self) -> &settings::AccountSettings {
        &self.account
    }

    pub fn get_open_orders(&self) -> &[OrderInfo] {
        &self.open
    }

    pub fn get_closed_orders(&self) -> &[OrderInfo] {
        &self.closed
    }

    pub fn get_signals(&self) -> &[TradeSignal] {
        &self.signals
    }

    pub fn get_counters(&self) -> TradeCounters {
        self.counters
    }

    /// Mean holding time of closed market orders, in seconds.
    pub fn avg_trade_duration(&self) -> f64 {
        if self.market_closes == 0 {
            0.0
        } else {
            self.total_trade_duration / self.market_closes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> settings::AccountSettings {
        settings::AccountSettings {
            minimum_stop: 0.0010,
            ..Default::default()
        }
    }

    fn quote(time: i64, bid: f64, ask: f64) -> Quote {
        Quote { time, bid, ask, conversion: 1.0, last_bar: None }
    }

    fn bar(time: i64, low: f64, high: f64) -> rates::Rate {
        rates::Rate { time, open: low, high, low, close: high, ..Default::default() }
    }

    fn open_result(order_type: OrderType, lots: f64, sl: f64, tp: f64) -> native::StrategyResult {
        native::StrategyResult {
            trading_signals: signal_flag(order_type, SignalAction::Open) as f64,
            lots,
            broker_sl: sl,
            broker_tp: tp,
            ..Default::default()
        }
    }

    fn close_result(order_type: OrderType, ticket: i64) -> native::StrategyResult {
        native::StrategyResult {
            ticket_number: ticket as f64,
            trading_signals: signal_flag(order_type, SignalAction::Close) as f64,
            ..Default::default()
        }
    }

    #[test]
    fn test_buy_round_trip_realizes_contract_profit() {
        let mut book = OrderBook::new(1, account(), 10_000.0, 1);
        book.apply_results(&[open_result(OrderType::Buy, 1.0, 0.0, 0.0)], &quote(60, 1.0999, 1.1000)).unwrap();
        book.apply_results(&[close_result(OrderType::Buy, -1)], &quote(120, 1.1050, 1.1051)).unwrap();

        assert!(book.get_open_orders().is_empty());
        assert!((book.get_balance() - 10_500.0).abs() < 1e-6);
        assert_eq!(book.get_counters().num_longs, 1);
        book.check_ledger().unwrap();
        assert_eq!(book.avg_trade_duration(), 60.0);
    }

    #[test]
    fn test_sell_pays_commission_and_swap() {
        let account = settings::AccountSettings {
            commission_per_lot: 7.0,
            swap_short: -2.0,
            ..account()
        };
        let mut book = OrderBook::new(1, account, 10_000.0, 1);
        // Monday 2010-02-01 00:00
        let t0 = 1_264_982_400;
        book.apply_results(&[open_result(OrderType::Sell, 2.0, 0.0, 0.0)], &quote(t0, 1.2000, 1.2002)).unwrap();
        book.accrue_swap(t0 + 7200);
        book.apply_results(&[close_result(OrderType::Sell, 1)], &quote(t0 + 7260, 1.1898, 1.1900)).unwrap();

        let closed = &book.get_closed_orders()[0];
        // 0.0100 * 2 * 100000 = 2000, minus 14 commission, minus 4 swap
        assert!((closed.profit - 1982.0).abs() < 1e-6);
        book.check_ledger().unwrap();
    }

    #[test]
    fn test_unknown_ticket_is_invariant_violation() {
        let mut book = OrderBook::new(1, account(), 10_000.0, 1);
        let err = book.apply_results(&[close_result(OrderType::Buy, 42)], &quote(60, 1.0, 1.0)).unwrap_err();
        assert_eq!(err.category(), "invariant");
        // wildcard on an empty book is a no-op
        book.apply_results(&[close_result(OrderType::Buy, -1)], &quote(60, 1.0, 1.0)).unwrap();
    }

    #[test]
    fn test_max_open_orders_surfaced() {
        let mut book = OrderBook::new(1, account(), 10_000.0, 1);
        book.apply_results(&[open_result(OrderType::Buy, 1.0, 0.0, 0.0)], &quote(60, 1.0, 1.0)).unwrap();
        let err = book.apply_results(&[open_result(OrderType::Sell, 1.0, 0.0, 0.0)], &quote(120, 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, BridgeError::MaxOpenOrdersExceeded { max: 1, .. }));
    }

    #[test]
    fn test_small_lots_and_close_stops_rejected() {
        let mut book = OrderBook::new(1, account(), 10_000.0, 2);
        book.apply_results(&[open_result(OrderType::Buy, 0.001, 0.0, 0.0)], &quote(60, 1.0, 1.0)).unwrap();
        assert!(book.get_open_orders().is_empty());

        book.apply_results(&[open_result(OrderType::Buy, 1.0, 0.0005, 0.0020)], &quote(60, 1.1, 1.1)).unwrap();
        let order = &book.get_open_orders()[0];
        assert_eq!(order.stop_loss, 0.0);
        assert!((order.take_profit - 1.1020).abs() < 1e-12);
    }

    #[test]
    fn test_stop_loss_hit_on_closed_bar() {
        let mut book = OrderBook::new(1, account(), 10_000.0, 1);
        book.apply_results(&[open_result(OrderType::Buy, 1.0, 0.0050, 0.0100)], &quote(60, 1.1000, 1.1000)).unwrap();

        let q = Quote { last_bar: Some(bar(60, 1.0940, 1.1010)), ..quote(120, 1.0960, 1.0960) };
        book.check_stops(&q);

        let signal = book.get_signals().last().unwrap();
        assert_eq!(signal.kind, SignalKind::StopLoss);
        assert!((signal.price - 1.0950).abs() < 1e-12);
        assert!((book.get_balance() - 9_500.0).abs() < 1e-6);
    }

    #[test]
    fn test_take_profit_hit_for_sell() {
        let mut book = OrderBook::new(1, account(), 10_000.0, 1);
        book.apply_results(&[open_result(OrderType::Sell, 1.0, 0.0050, 0.0030)], &quote(60, 1.1000, 1.1000)).unwrap();
        let q = Quote { last_bar: Some(bar(60, 1.0960, 1.1005)), ..quote(120, 1.0980, 1.0980) };
        book.check_stops(&q);
        assert_eq!(book.get_signals().last().unwrap().kind, SignalKind::TakeProfit);
        assert!((book.get_balance() - 10_300.0).abs() < 1e-6);
    }

    #[test]
    fn test_pending_fill_and_cancel() {
        let mut book = OrderBook::new(1, account(), 10_000.0, 2);
        let limit = native::StrategyResult { entry_price: 1.0950, ..open_result(OrderType::BuyLimit, 1.0, 0.0, 0.0) };
        let limit_sell = native::StrategyResult { entry_price: 1.2000, ..open_result(OrderType::SellLimit, 1.0, 0.0, 0.0) };
        book.apply_results(&[limit, limit_sell], &quote(60, 1.1000, 1.1000)).unwrap();
        assert_eq!(book.get_counters().total_trades, 2);

        let q = Quote { last_bar: Some(bar(60, 1.0940, 1.1010)), ..quote(120, 1.0960, 1.0960) };
        book.check_pending(&q);
        assert_eq!(book.get_open_orders()[0].order_type, OrderType::Buy);
        assert_eq!(book.get_open_orders()[0].open_time, 120);

        book.apply_results(&[close_result(OrderType::SellLimit, -1)], &q).unwrap();
        assert_eq!(book.get_counters().total_trades, 1);
        assert_eq!(book.get_counters().num_shorts, 0);
        assert_eq!(book.get_open_orders().len(), 1);
    }

    #[test]
    fn test_modify_from_current_price() {
        let mut book = OrderBook::new(1, account(), 10_000.0, 1);
        book.apply_results(&[open_result(OrderType::Buy, 1.0, 0.0050, 0.0)], &quote(60, 1.1000, 1.1000)).unwrap();
        let update = native::StrategyResult {
            ticket_number: 1.0,
            trading_signals: signal_flag(OrderType::Buy, SignalAction::Update) as f64,
            broker_sl: 0.0020,
            broker_tp: 0.0040,
            ..Default::default()
        };
        book.apply_results(&[update], &quote(120, 1.1030, 1.1030)).unwrap();
        let order = &book.get_open_orders()[0];
        assert!((order.stop_loss - 1.1010).abs() < 1e-12);
        assert!((order.take_profit - 1.1070).abs() < 1e-12);
    }

    #[test]
    fn test_wednesday_swap_tripled() {
        let account = settings::AccountSettings { swap_long: 1.5, ..account() };
        let mut book = OrderBook::new(1, account, 10_000.0, 1);
        // Wednesday 2010-02-03 00:00
        let wednesday = 1_265_155_200;
        book.apply_results(&[open_result(OrderType::Buy, 2.0, 0.0, 0.0)], &quote(wednesday, 1.0, 1.0)).unwrap();
        book.accrue_swap(wednesday);
        assert!((book.get_open_orders()[0].swap - 9.0).abs() < 1e-12);
        book.accrue_swap(wednesday + 1800);
        assert!((book.get_open_orders()[0].swap - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_floating_and_margin() {
        let mut book = OrderBook::new(1, account(), 10_000.0, 1);
        book.apply_results(&[open_result(OrderType::Buy, 0.5, 0.0, 0.0)], &quote(60, 1.1000, 1.1000)).unwrap();
        let q = quote(120, 1.1020, 1.1021);
        assert!((book.floating_profit(&q) - 100.0).abs() < 1e-6);
        assert!((book.equity(&q) - 10_100.0).abs() < 1e-6);
        assert!((book.margin() - 500.0).abs() < 1e-9);
        assert_eq!(book.open_orders_c()[0].is_open, 1.0);
    }
}
