#![allow(dead_code)]

pub mod geography;
pub mod harness;
pub mod ledger;
