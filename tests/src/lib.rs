//! Reusable fixtures for exercising `staffetta` without a real
//! coordination store: an in-memory discovery backend, scripted health
//! probes and a real tonic health server for probe tests.

pub mod discovery;
pub mod health_server;
pub mod pb;
pub mod probe;
