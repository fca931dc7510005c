//! End-to-end controller tests against the scripted mock backend.

mod helpers;

mod ec;
