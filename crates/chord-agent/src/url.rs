//! `chord://<server-name>/<machine-id>` — the only URL shape this agent
//! produces or accepts for a machine.

use chord_core::{ChordError, MachineId};

pub fn machine_url(server_name: &str, name: &MachineId) -> String {
    format!("chord://{server_name}/{name}")
}

pub fn machine_id_from_url(url: &str) -> Result<MachineId, ChordError> {
    let rest = url
        .strip_prefix("chord://")
        .ok_or_else(|| ChordError::invalid_configuration(format!("malformed machine url: {url}")))?;
    let name = rest
        .split('/')
        .nth(1)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ChordError::invalid_configuration(format!("malformed machine url: {url}")))?;
    Ok(MachineId::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_machine_url() {
        let id = MachineId::from("m1");
        let url = machine_url("agent.chord", &id);
        assert_eq!(machine_id_from_url(&url).unwrap().as_str(), "m1");
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(machine_id_from_url("not-a-url").is_err());
        assert!(machine_id_from_url("chord://agent.chord/").is_err());
    }
}
