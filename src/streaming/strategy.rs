//! Book-imbalance momentum strategy.
//!
//! Enters in the direction of top-of-book depth imbalance: a bid-heavy YES
//! book means buy YES, an ask-heavy one means buy NO. Filters run cheapest
//! first so most events exit before touching any shared state.

use chrono::Utc;
use tracing::debug;

use crate::book::OrderBook;
use crate::db::MarketRow;
use crate::executor::safety::Signal;
use crate::models::{OrderSide, TokenSide};
use crate::streaming::config::StreamingConfig;
use crate::streaming::state::StreamingState;

pub struct BookImbalanceStrategy {
    config: StreamingConfig,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Rejection {
    BelowThreshold,
    PriceZone,
    Spread,
    TimeToClose,
    PositionLimit,
    Cooldown,
}

impl BookImbalanceStrategy {
    pub fn new(config: StreamingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Evaluate one book snapshot. `book_side` is which outcome token the
    /// book belongs to. Returns a ready-to-execute signal or the first
    /// filter that dropped the event.
    pub fn evaluate(
        &self,
        book: &OrderBook,
        book_side: TokenSide,
        market: &MarketRow,
        state: &StreamingState,
    ) -> Result<Signal, Rejection> {
        // 1. Imbalance threshold - the cheapest check and the usual exit.
        let imbalance = book.imbalance();
        if imbalance.abs() < self.config.min_imbalance {
            return Err(Rejection::BelowThreshold);
        }

        // Bid-heavy book: depth supports this token, buy it. Ask-heavy:
        // depth is selling it, buy the other side.
        let target_side = if imbalance > 0.0 {
            book_side
        } else {
            book_side.opposite()
        };

        // 2. Price zone on the YES quote.
        let yes_price = market
            .yes_price
            .or_else(|| book.mid().map(|m| match book_side {
                TokenSide::Yes => m,
                TokenSide::No => 1.0 - m,
            }))
            .ok_or(Rejection::PriceZone)?;
        if yes_price < self.config.yes_price_min || yes_price > self.config.yes_price_max {
            return Err(Rejection::PriceZone);
        }

        // 3. Spread.
        let spread = book.spread().unwrap_or_else(|| market.computed_spread());
        if spread > self.config.max_spread {
            return Err(Rejection::Spread);
        }

        // 4. Time to close.
        if let Some(end_time) = market.end_time {
            let minutes_left = (end_time - Utc::now()).num_milliseconds() as f64 / 60_000.0;
            if minutes_left < self.config.min_minutes_to_close
                || minutes_left > self.config.max_hours_to_close * 60.0
            {
                return Err(Rejection::TimeToClose);
            }
        }

        // 5. Per-strategy position count.
        if state.position_count(&self.config.name) >= self.config.max_positions {
            return Err(Rejection::PositionLimit);
        }

        // 6. Cooldown on this market.
        if state.in_cooldown(&self.config.name, market.market_id, self.config.cooldown_minutes) {
            return Err(Rejection::Cooldown);
        }

        let token_id = match target_side {
            TokenSide::Yes => market.yes_token_id.clone(),
            TokenSide::No => market.no_token_id.clone(),
        };
        let target_price = match target_side {
            TokenSide::Yes => market.yes_price,
            TokenSide::No => market.no_price,
        }
        .unwrap_or(match target_side {
            TokenSide::Yes => yes_price,
            TokenSide::No => 1.0 - yes_price,
        });

        debug!(
            market_id = %market.market_id,
            imbalance = %format!("{imbalance:.3}"),
            side = %target_side.as_str(),
            "imbalance entry signal"
        );

        let mut signal = Signal::new(
            &self.config.name,
            market.market_id,
            &token_id,
            target_side,
            OrderSide::Buy,
        );
        signal.reason = format!(
            "book imbalance {imbalance:+.2} -> buy {}",
            target_side.as_str()
        );
        signal.edge = Some(imbalance.abs());
        signal.price_at_signal = Some(target_price);
        signal.suggested_size_usd = Some(self.position_size());
        Ok(signal)
    }

    fn position_size(&self) -> f64 {
        self.config.fixed_size_usd
    }

    /// Exit check for an open streaming position: profit target or max hold.
    pub fn check_exit(
        &self,
        avg_entry_price: f64,
        current_price: f64,
        held_minutes: f64,
    ) -> Option<&'static str> {
        if avg_entry_price > 0.0 {
            let profit_pct = (current_price - avg_entry_price) / avg_entry_price;
            if profit_pct >= self.config.profit_target_pct {
                return Some("profit_target");
            }
        }
        if held_minutes >= self.config.max_hold_minutes {
            return Some("max_hold");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::PriceLevel;
    use crate::models::{MarketType, MatchFormat};

    fn level(price: f64, size: f64) -> PriceLevel {
        PriceLevel { price, size }
    }

    fn bid_heavy_book() -> OrderBook {
        OrderBook::new(
            "yes-1",
            vec![level(0.49, 80.0), level(0.48, 60.0)],
            vec![level(0.51, 20.0)],
        )
    }

    fn market() -> MarketRow {
        MarketRow {
            market_id: 1,
            condition_id: "0xc1".to_string(),
            yes_token_id: "yes-1".to_string(),
            no_token_id: "no-1".to_string(),
            question: "A vs B".to_string(),
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: Some(Utc::now()),
            format: Some(MatchFormat::Bo3),
            market_type: Some(MarketType::Moneyline),
            category: Some("CSGO".to_string()),
            end_time: Some(Utc::now() + chrono::Duration::hours(2)),
            resolved: false,
            closed: false,
            liquidity: None,
            yes_price: Some(0.50),
            no_price: Some(0.50),
            best_bid: Some(0.49),
            best_ask: Some(0.51),
            last_quote_at: Some(Utc::now()),
        }
    }

    fn strategy() -> BookImbalanceStrategy {
        BookImbalanceStrategy::new(StreamingConfig {
            min_imbalance: 0.5,
            ..StreamingConfig::default()
        })
    }

    #[test]
    fn bid_heavy_yes_book_buys_yes() {
        let state = StreamingState::new();
        let signal = strategy()
            .evaluate(&bid_heavy_book(), TokenSide::Yes, &market(), &state)
            .unwrap();
        assert_eq!(signal.token_side, TokenSide::Yes);
        assert_eq!(signal.token_id, "yes-1");
        assert_eq!(signal.side, OrderSide::Buy);
    }

    #[test]
    fn ask_heavy_yes_book_buys_no() {
        let book = OrderBook::new(
            "yes-1",
            vec![level(0.49, 10.0)],
            vec![level(0.51, 90.0), level(0.52, 40.0)],
        );
        let state = StreamingState::new();
        let signal = strategy()
            .evaluate(&book, TokenSide::Yes, &market(), &state)
            .unwrap();
        assert_eq!(signal.token_side, TokenSide::No);
        assert_eq!(signal.token_id, "no-1");
    }

    #[test]
    fn weak_imbalance_exits_early() {
        let book = OrderBook::new(
            "yes-1",
            vec![level(0.49, 55.0)],
            vec![level(0.51, 45.0)],
        );
        let state = StreamingState::new();
        let err = strategy()
            .evaluate(&book, TokenSide::Yes, &market(), &state)
            .unwrap_err();
        assert_eq!(err, Rejection::BelowThreshold);
    }

    #[test]
    fn zone_spread_and_time_filters() {
        let state = StreamingState::new();
        let strat = strategy();

        let mut lopsided = market();
        lopsided.yes_price = Some(0.85);
        assert_eq!(
            strat
                .evaluate(&bid_heavy_book(), TokenSide::Yes, &lopsided, &state)
                .unwrap_err(),
            Rejection::PriceZone
        );

        let wide_book = OrderBook::new(
            "yes-1",
            vec![level(0.40, 80.0)],
            vec![level(0.60, 20.0)],
        );
        assert_eq!(
            strat
                .evaluate(&wide_book, TokenSide::Yes, &market(), &state)
                .unwrap_err(),
            Rejection::Spread
        );

        let mut closing = market();
        closing.end_time = Some(Utc::now() + chrono::Duration::seconds(30));
        assert_eq!(
            strat
                .evaluate(&bid_heavy_book(), TokenSide::Yes, &closing, &state)
                .unwrap_err(),
            Rejection::TimeToClose
        );
    }

    #[test]
    fn position_limit_and_cooldown_block() {
        let state = StreamingState::new();
        let strat = strategy();

        state.set_position_count(&strat.config.name, strat.config.max_positions);
        assert_eq!(
            strat
                .evaluate(&bid_heavy_book(), TokenSide::Yes, &market(), &state)
                .unwrap_err(),
            Rejection::PositionLimit
        );

        state.set_position_count(&strat.config.name, 0);
        state.set_cooldown(&strat.config.name, 1);
        assert_eq!(
            strat
                .evaluate(&bid_heavy_book(), TokenSide::Yes, &market(), &state)
                .unwrap_err(),
            Rejection::Cooldown
        );
    }

    #[test]
    fn exit_on_profit_target_or_max_hold() {
        let strat = strategy();
        assert_eq!(strat.check_exit(0.50, 0.56, 5.0), Some("profit_target"));
        assert_eq!(strat.check_exit(0.50, 0.51, 5.0), None);
        assert_eq!(
            strat.check_exit(0.50, 0.48, strat.config.max_hold_minutes + 1.0),
            Some("max_hold")
        );
    }
}
