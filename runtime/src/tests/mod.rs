//! Runtime unit tests.
//!
//! Component-level tests that do not need the worker pool: the ring, the
//! channel's bare-thread paths, stacks, legion state, and the raw context
//! switcher. Full scheduler scenarios live in `tests/scenarios`.

mod stack_tests;
