use mcfleet_common::runtime::{desired_data_bind, desired_env};
use mcfleet_common::{InstanceRecord, ObservedContainer};

/// Decide whether an existing container still satisfies a desired record.
///
/// The tracked set is closed: version, flavor, container-side port, every
/// port mapping's host side, the data-directory bind, CPU and memory limits,
/// and the command-channel port/credential. Any mismatch forces recreation;
/// untracked differences never do.
pub fn needs_recreation(observed: &ObservedContainer, desired: &InstanceRecord) -> bool {
    for entry in desired_env(desired) {
        if !observed.env.contains(&entry) {
            return true;
        }
    }

    if !host_port_bound(observed, desired.container_port, desired.port) {
        return true;
    }
    for mapping in &desired.additional_ports {
        if !host_port_bound(observed, mapping.container, mapping.host) {
            return true;
        }
    }

    let expected_bind = desired_data_bind(desired);
    if !observed.binds.iter().any(|bind| bind == &expected_bind) {
        return true;
    }

    if observed.nano_cpus != Some((desired.cpu_limit * 1e9) as i64) {
        return true;
    }
    if observed.memory_bytes != Some(desired.memory_limit_mib as i64 * 1024 * 1024) {
        return true;
    }

    false
}

fn host_port_bound(observed: &ObservedContainer, container_port: u16, host_port: u16) -> bool {
    observed
        .port_bindings
        .get(&format!("{container_port}/tcp"))
        .map(String::as_str)
        == Some(host_port.to_string().as_str())
}
