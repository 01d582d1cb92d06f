pub mod provisioning_run;

#[cfg(test)]
pub(crate) mod test_utils;
