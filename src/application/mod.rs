// ============================================================
// Layer 2: Application
// ============================================================
// Coordinates the other layers for one run. Nothing here
// parses peak files, does model math or prints to the terminal;
// it only decides what happens in which order.

// Run configuration loaded from JSON
pub mod config;

// The model runner lifecycle (train / predict / evaluate)
pub mod runner;
