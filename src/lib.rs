//! Workspace-level integration tests for `strata`. See `tests/`.
