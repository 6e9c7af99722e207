//! Integration tests for db-execfilter.

pub mod exec_test;
pub mod results_test;
