//! Handlers for `Sin`, `Cos` and `Tan`.

use super::UnaryHandler;

pub const SIN: UnaryHandler = UnaryHandler {
    name: "Sin",
    cost: 6.0,
    apply: f64::sin,
};

pub const COS: UnaryHandler = UnaryHandler {
    name: "Cos",
    cost: 6.0,
    apply: f64::cos,
};

pub const TAN: UnaryHandler = UnaryHandler {
    name: "Tan",
    cost: 7.0,
    apply: f64::tan,
};
