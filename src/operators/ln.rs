//! Handler for the natural logarithm `Log`.

use super::UnaryHandler;

pub const LOG: UnaryHandler = UnaryHandler {
    name: "Log",
    cost: 5.0,
    apply: f64::ln,
};
