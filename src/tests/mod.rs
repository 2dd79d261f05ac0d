/*
The integration tests live in the library binary itself so they have
access to crate internals (queue snapshots) without external linking.
*/

mod common;

mod beam_threaded_test;
