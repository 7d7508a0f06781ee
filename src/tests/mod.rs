
mod election_tests;
