//! Adaptive conntrack event consumer.
//!
//! `ctmon` hooks into the kernel's connection-tracking subsystem over
//! netlink and exposes two bounded streams of raw protocol messages: live
//! new-connection notifications and one-shot table dumps. Under high
//! connection churn it throttles itself by recreating the socket with a
//! kernel-side sampling filter, keeping CPU cost bounded instead of falling
//! behind the kernel.
//!
//! All socket system calls happen on one dedicated worker thread pinned to
//! the target network namespace for the consumer's entire lifetime; see
//! [`conntrack::Consumer`].

pub mod conntrack;
pub mod probes;
pub mod runtime;
