// ABOUTME: Test support for engine consumers.
// ABOUTME: Exposes the scripted mock engine.

pub mod mock;

pub use mock::MockEngine;
