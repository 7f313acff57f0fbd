
#[cfg(test)]
pub mod controller_tests;

#[cfg(test)]
pub mod sequencer_tests;
