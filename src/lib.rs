//! Deterministic multi-resolution spatial field sampling engine for
//! procedurally generated worlds. See SPEC_FULL.md for the full module
//! map; each provider domain below follows the same query shape: a
//! caller-supplied [`domain::Budget`] and point/tick produce a sample with
//! a [`domain::QueryMeta`] describing what resolution tier answered and
//! how confident the result is.

pub mod animal;
pub mod climate;
pub mod domain;
pub mod error;
pub mod fixed;
pub mod geology;
pub mod rng;
pub mod terrain;
pub mod vegetation;
pub mod weather;
