//! Integration tests for the gateway HTTP surface.

mod support;

mod api {
    mod admin;
    mod chat_completions;
    mod models;
}

mod security {
    mod authentication;
    mod rate_limiting;
}
