//! Tests for the Meta Ads client.


#[cfg(test)]
mod resilience_tests;
