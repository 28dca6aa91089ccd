mod common;
mod orchestrate_tests;
