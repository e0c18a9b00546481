//! Handler for `Sqrt`.

use super::UnaryHandler;

pub const SQRT: UnaryHandler = UnaryHandler {
    name: "Sqrt",
    cost: 1.0,
    apply: f64::sqrt,
};
