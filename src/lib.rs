#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
#![doc = include_str!("../README.md")]

pub mod prelude;

pub mod alert;
pub mod channels;
pub mod chat;
pub mod config;
pub mod dedup;
pub mod graph;
pub mod metrics;
pub mod normalizer;
pub mod render;
pub mod routing;
pub mod service;
pub mod tools;
pub mod web;
pub mod webhook;
