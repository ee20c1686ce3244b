//! End-to-end smoke tests against an in-process mock portal live in `tests/`.
