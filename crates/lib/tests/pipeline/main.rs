//! End-to-end tests for `RecipePipeline` against a mock source server.

#![cfg(unix)]

mod common;

mod concurrency_tests;
mod failure_tests;
mod success_tests;
