//! Payer compliance stages applied after rule evaluation: code-family
//! normalization, NCCI PTP bundling, mutually exclusive pairs, add-on gating
//! and Multiple Endoscopy Rule payment roles.

pub mod addon;
pub mod exclusive;
pub mod hierarchy;
pub mod mer;
pub mod ncci;
