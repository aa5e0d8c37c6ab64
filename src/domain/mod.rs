//! Core domain types and logic.

pub mod action;
pub mod block;
pub mod condition;
pub mod config_validation;
pub mod error;
pub mod ids;
pub mod payload;
pub mod strategy;
pub mod strategy_service;
pub mod tree;
pub mod tree_mutation;
