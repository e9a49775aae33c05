//! Matching Service - pairs uploaded receipts with bank/card transactions.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod matching;
pub mod models;
pub mod services;
pub mod startup;
