//! 도메인 타입 모음.

pub mod instrument;
pub mod market;
pub mod order;
pub mod position;

pub use instrument::InstrumentSpec;
pub use market::Quote;
pub use order::{
    IntentOrigin, IntentResolution, OrderIntent, OrderKind, OrderStatus, OrderUpdate, Side,
};
pub use position::{MarginMode, PositionSnapshot, PositionSource};
