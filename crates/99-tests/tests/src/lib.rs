//! End-to-end scenarios for the batch exchange: config -> allocator ->
//! engine -> dispatcher -> replies.

#[cfg(test)]
mod dispatch_scenarios;

#[cfg(test)]
mod native_e2e;
