

#[cfg(test)]
pub mod fragment_tests;



#[cfg(test)]
pub mod netfilter_tests;

#[cfg(test)]
pub mod runtime_tests;
