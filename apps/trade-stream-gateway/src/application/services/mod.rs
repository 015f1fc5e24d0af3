//! Application Services
//!
//! - [`TradeDataService`]: composes the upstream feed, the subscription
//!   multiplexer and the trade repository into one lifecycle-managed service.

mod trade_data;

pub use trade_data::{ServiceError, ServiceEvent, TradeDataService};
