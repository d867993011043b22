// Integration test suite for the chat archiver.
//
// Organized into focused modules by subsystem. Database-backed modules share
// the common::TestDb harness for temp-file lifecycle management; the
// backfill module drives the real pagination loops against a stub API.


mod backfill;
mod cache_state;
mod codec;
mod messages;
mod permissions;
mod rate_limit;
mod reactions;
mod store_queries;
mod timing;
