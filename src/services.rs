//! Registered services
//!
//! Services are VPEs that registered a name and a receive endpoint with the
//! kernel. The core consults the list to satisfy VPE requirements and to
//! broadcast the shutdown request when only daemons are left.

use alloc::string::String;
use alloc::vec::Vec;

use crate::dtu::Dtu;
use crate::error::KernResult;
use crate::types::{EpId, VpeDesc, VpeId};

/// Opcode of the shutdown request sent to services
pub const OP_SHUTDOWN: u64 = 4;

/// A registered service
#[derive(Debug, Clone)]
pub struct Service {
    name: String,
    vpe: VpeId,
    pe: usize,
    ep: EpId,
}

impl Service {
    pub fn new(name: String, vpe: VpeId, pe: usize, ep: EpId) -> Self {
        Self { name, vpe, pe, ep }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vpe(&self) -> VpeId {
        self.vpe
    }

    fn desc(&self) -> VpeDesc {
        VpeDesc::new(self.pe, self.vpe)
    }
}

/// All registered services
pub struct ServiceList {
    list: Vec<Service>,
}

impl ServiceList {
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn add(&mut self, service: Service) {
        klog!(SERV, "Registered service '{}'", service.name());
        self.list.push(service);
    }

    pub fn find(&self, name: &str) -> Option<&Service> {
        self.list.iter().find(|s| s.name == name)
    }

    /// Drop every service belonging to the VPE
    pub fn remove_vpe(&mut self, vpe: VpeId) {
        self.list.retain(|s| s.vpe != vpe);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Send the shutdown request to one service
    pub fn send_shutdown(&self, dtu: &Dtu, service: &Service) -> KernResult<()> {
        klog!(SERV, "Sending SHUTDOWN message to '{}'", service.name());
        dtu.send_to(&service.desc(), service.ep, 0, &OP_SHUTDOWN.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_find_and_remove() {
        let mut list = ServiceList::new();
        list.add(Service::new("net".to_string(), 3, 1, 2));
        list.add(Service::new("fs".to_string(), 4, 2, 2));

        assert!(list.find("net").is_some());
        assert!(list.find("pager").is_none());

        list.remove_vpe(3);
        assert!(list.find("net").is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_shutdown_message() {
        let dtu = Dtu::new(4);
        let list = ServiceList::new();
        let srv = Service::new("fs".to_string(), 4, 2, 2);
        list.send_shutdown(&dtu, &srv).unwrap();
        let sent = dtu.sim_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 2);
        assert_eq!(sent[0].3, OP_SHUTDOWN.to_le_bytes().to_vec());
    }
}
