//! Integration tests for qa-harvester

mod harvest_tests;
