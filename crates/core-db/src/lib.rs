//! Postgres-backed row types, queries, and migrations for the task store.
//!
//! This crate has no knowledge of scheduling, pooling, or health-checking
//! policy -- it is a thin, typed layer over the `tasks`, `scheduled_tasks`,
//! `worker_pools`, `health_issues`, `performance_metrics`, and `task_events`
//! tables. Policy lives in `core-engine`.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
