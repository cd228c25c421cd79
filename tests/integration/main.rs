//! End-to-end engine scenarios against the paper collaborators.

mod harness;

mod actions;
mod counter;
mod escrow;
mod queue;
mod sync;
