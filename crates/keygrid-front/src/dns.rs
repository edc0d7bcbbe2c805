//! DNS binding for the front's address.

use keygrid_cloud::{DnsRecord, FrontHandle};
use keygrid_core::DnsBinding;

/// The record that binds `binding.name` to the front.
pub fn desired_record(binding: &DnsBinding, handle: &FrontHandle) -> DnsRecord {
    DnsRecord {
        zone: binding.zone.clone(),
        name: binding.name.clone(),
        target: handle.address.clone(),
        ttl: binding.ttl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_targets_front_address() {
        let binding = DnsBinding {
            zone: "example.com".to_string(),
            name: "vault.example.com".to_string(),
            ttl: 60,
        };
        let handle = FrontHandle {
            name: "vault-front".to_string(),
            address: "vault-front.lb.keygrid.internal".to_string(),
        };
        let record = desired_record(&binding, &handle);
        assert_eq!(record.target, handle.address);
        assert_eq!(record.name, "vault.example.com");
        assert_eq!(record.ttl, 60);
    }
}
