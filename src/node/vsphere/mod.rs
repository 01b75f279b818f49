//! vSphere SDK client: session login, inventory retrieval, VM-level
//! snapshots, changed-block queries and datastore file reads. Talks SOAP
//! to `{vcenter_url}/sdk` and plain HTTP to the datastore file service.

pub mod soap;
pub mod types;

use crate::config::NodeConfig;
use crate::node::error::NodeError;
use soap::{envelope, extract_all_tags, extract_tag, extract_typed_elements, fault_string, is_fault, xml_escape};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use types::{ChangedArea, DiskRecord, VmRecord};

/// Change id wildcard: "everything allocated", used to enumerate the
/// extents of a full backup.
pub const CHANGE_ID_ALL: &str = "*";

pub struct VSphereClient {
    http: reqwest::Client,
    config: Arc<NodeConfig>,
    session_cookie: RwLock<Option<String>>,
}

impl VSphereClient {
    pub fn new(config: Arc<NodeConfig>) -> Result<Self, NodeError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.vcenter_insecure_tls)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            http,
            config,
            session_cookie: RwLock::new(None),
        })
    }

    fn sdk_url(&self) -> String {
        format!("{}/sdk", self.config.vcenter_url.trim_end_matches('/'))
    }

    async fn post_soap(&self, body: &str) -> Result<String, NodeError> {
        let mut request = self
            .http
            .post(self.sdk_url())
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "urn:vim25/8.0")
            .body(envelope(body));

        if let Some(cookie) = self.session_cookie.read().await.as_ref() {
            request = request.header("Cookie", cookie.clone());
        }

        let response = request.send().await?;

        // The login response carries the session cookie; keep whatever
        // the server last handed us.
        if let Some(set_cookie) = response.headers().get("set-cookie") {
            if let Ok(value) = set_cookie.to_str() {
                if let Some(session) = value.split(';').next() {
                    *self.session_cookie.write().await = Some(session.to_string());
                }
            }
        }

        let text = response.text().await?;
        if is_fault(&text) {
            return Err(NodeError::Vsphere(fault_string(&text)));
        }
        Ok(text)
    }

    /// Authenticates the SOAP session.
    pub async fn login(&self) -> Result<(), NodeError> {
        let body = format!(
            r#"<urn:Login><_this type="SessionManager">SessionManager</_this><userName>{}</userName><password>{}</password></urn:Login>"#,
            xml_escape(&self.config.vcenter_username),
            xml_escape(&self.config.vcenter_password),
        );
        self.post_soap(&body).await?;
        log::info!("vSphere session established for {}", self.config.vcenter_username);
        Ok(())
    }

    /// Retrieves every VM with its disks through a container view over
    /// the inventory root.
    pub async fn list_vms(&self) -> Result<Vec<VmRecord>, NodeError> {
        let view_body = r#"<urn:CreateContainerView><_this type="ViewManager">ViewManager</_this><container type="Folder">group-d1</container><type>VirtualMachine</type><recursive>true</recursive></urn:CreateContainerView>"#;
        let view_response = self.post_soap(view_body).await?;
        let view = extract_tag(&view_response, "returnval")
            .ok_or_else(|| NodeError::Vsphere("no container view returned".to_string()))?;

        let props_body = format!(
            r#"<urn:RetrievePropertiesEx><_this type="PropertyCollector">propertyCollector</_this><specSet><propSet><type>VirtualMachine</type><pathSet>name</pathSet><pathSet>config.instanceUuid</pathSet><pathSet>runtime.powerState</pathSet><pathSet>config.hardware.device</pathSet></propSet><objectSet><obj type="ContainerView">{}</obj><skip>true</skip><selectSet xsi:type="TraversalSpec"><name>view</name><type>ContainerView</type><path>view</path><skip>false</skip></selectSet></objectSet></specSet><options/></urn:RetrievePropertiesEx>"#,
            view
        );
        let response = self.post_soap(&props_body).await?;

        let mut vms = Vec::new();
        for object in extract_all_tags(&response, "objects") {
            let Some(moref) = extract_tag(&object, "obj") else {
                continue;
            };

            let mut name = String::new();
            let mut instance_uuid = String::new();
            let mut power_state = None;
            let mut disks = Vec::new();

            for prop_set in extract_all_tags(&object, "propSet") {
                let Some(prop_name) = extract_tag(&prop_set, "name") else {
                    continue;
                };
                match prop_name.as_str() {
                    "name" => name = extract_tag(&prop_set, "val").unwrap_or_default(),
                    "config.instanceUuid" => {
                        instance_uuid = extract_tag(&prop_set, "val").unwrap_or_default()
                    }
                    "runtime.powerState" => power_state = extract_tag(&prop_set, "val"),
                    "config.hardware.device" => disks = parse_disks(&prop_set),
                    _ => {}
                }
            }

            if name.is_empty() {
                continue;
            }
            vms.push(VmRecord {
                moref,
                name,
                instance_uuid,
                power_state,
                disks,
            });
        }

        Ok(vms)
    }

    /// Finds one VM by instance UUID, falling back to name.
    pub async fn find_vm(&self, name: &str, instance_uuid: &str) -> Result<VmRecord, NodeError> {
        let vms = self.list_vms().await?;
        vms.iter()
            .find(|vm| !instance_uuid.is_empty() && vm.instance_uuid == instance_uuid)
            .or_else(|| vms.iter().find(|vm| vm.name == name))
            .cloned()
            .ok_or_else(|| NodeError::VmNotFound(name.to_string()))
    }

    /// Re-reads the disk set of one VM; used after the snapshot to pick
    /// up the fresh CBT change ids.
    pub async fn refresh_disks(&self, vm_moref: &str) -> Result<Vec<DiskRecord>, NodeError> {
        let body = format!(
            r#"<urn:RetrievePropertiesEx><_this type="PropertyCollector">propertyCollector</_this><specSet><propSet><type>VirtualMachine</type><pathSet>config.hardware.device</pathSet></propSet><objectSet><obj type="VirtualMachine">{}</obj></objectSet></specSet><options/></urn:RetrievePropertiesEx>"#,
            vm_moref
        );
        let response = self.post_soap(&body).await?;
        Ok(parse_disks(&response))
    }

    /// Takes one snapshot covering every disk of the VM and returns its
    /// managed object reference. Memory is excluded; the guest is
    /// quiesced for application consistency.
    pub async fn create_snapshot(
        &self,
        vm_moref: &str,
        snapshot_name: &str,
    ) -> Result<String, NodeError> {
        let body = format!(
            r#"<urn:CreateSnapshot_Task><_this type="VirtualMachine">{}</_this><name>{}</name><description>corevault transport snapshot</description><memory>false</memory><quiesce>true</quiesce></urn:CreateSnapshot_Task>"#,
            vm_moref,
            xml_escape(snapshot_name),
        );
        let response = self.post_soap(&body).await?;
        let task = extract_tag(&response, "returnval")
            .ok_or_else(|| NodeError::Vsphere("CreateSnapshot_Task returned no task".to_string()))?;

        let result = self.wait_for_task(&task).await?;
        result.ok_or_else(|| NodeError::Vsphere("snapshot task finished without a result".to_string()))
    }

    /// Releases a snapshot. Always called, success or failure.
    pub async fn remove_snapshot(&self, snapshot_moref: &str) -> Result<(), NodeError> {
        let body = format!(
            r#"<urn:RemoveSnapshot_Task><_this type="VirtualMachineSnapshot">{}</_this><removeChildren>false</removeChildren></urn:RemoveSnapshot_Task>"#,
            snapshot_moref
        );
        let response = self.post_soap(&body).await?;
        if let Some(task) = extract_tag(&response, "returnval") {
            self.wait_for_task(&task).await?;
        }
        Ok(())
    }

    /// Polls a task to completion; returns `info.result` when present.
    async fn wait_for_task(&self, task_moref: &str) -> Result<Option<String>, NodeError> {
        loop {
            let body = format!(
                r#"<urn:RetrievePropertiesEx><_this type="PropertyCollector">propertyCollector</_this><specSet><propSet><type>Task</type><pathSet>info.state</pathSet><pathSet>info.result</pathSet><pathSet>info.error.localizedMessage</pathSet></propSet><objectSet><obj type="Task">{}</obj></objectSet></specSet><options/></urn:RetrievePropertiesEx>"#,
                task_moref
            );
            let response = self.post_soap(&body).await?;

            let mut state = String::new();
            let mut result = None;
            let mut error_message = None;
            for prop_set in extract_all_tags(&response, "propSet") {
                match extract_tag(&prop_set, "name").as_deref() {
                    Some("info.state") => {
                        state = extract_tag(&prop_set, "val").unwrap_or_default()
                    }
                    Some("info.result") => result = extract_tag(&prop_set, "val"),
                    Some("info.error.localizedMessage") => {
                        error_message = extract_tag(&prop_set, "val")
                    }
                    _ => {}
                }
            }

            match state.as_str() {
                "success" => return Ok(result),
                "error" => {
                    return Err(NodeError::Vsphere(
                        error_message.unwrap_or_else(|| "task failed".to_string()),
                    ))
                }
                _ => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }
    }

    /// Enumerates the disk areas that changed since `change_id` (or all
    /// allocated areas for the `*` wildcard), walking the query window
    /// until the whole disk is covered.
    pub async fn query_changed_areas(
        &self,
        vm_moref: &str,
        snapshot_moref: &str,
        device_key: i32,
        capacity_bytes: i64,
        change_id: &str,
    ) -> Result<Vec<ChangedArea>, NodeError> {
        let mut areas = Vec::new();
        let mut offset: i64 = 0;

        while offset < capacity_bytes {
            let body = format!(
                r#"<urn:QueryChangedDiskAreas><_this type="VirtualMachine">{}</_this><snapshot type="VirtualMachineSnapshot">{}</snapshot><deviceKey>{}</deviceKey><startOffset>{}</startOffset><changeId>{}</changeId></urn:QueryChangedDiskAreas>"#,
                vm_moref,
                snapshot_moref,
                device_key,
                offset,
                xml_escape(change_id),
            );
            let response = self.post_soap(&body).await?;

            for area in extract_all_tags(&response, "changedArea") {
                let start = extract_tag(&area, "start")
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                let length = extract_tag(&area, "length")
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                if length > 0 {
                    areas.push(ChangedArea { start, length });
                }
            }

            // The reply's own length field bounds the covered window.
            let covered = extract_all_tags(&response, "length")
                .first()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(capacity_bytes - offset);
            if covered <= 0 {
                break;
            }
            offset += covered;
        }

        Ok(areas)
    }

    /// Reads a byte range of a datastore file through the file service.
    pub async fn read_datastore_range(
        &self,
        datastore: &str,
        path: &str,
        start: u64,
        length: u64,
    ) -> Result<Vec<u8>, NodeError> {
        let url = format!(
            "{}/folder/{}?dcPath={}&dsName={}",
            self.config.vcenter_url.trim_end_matches('/'),
            path,
            urlencode(&self.config.vcenter_datacenter),
            urlencode(datastore),
        );

        let end = start + length - 1;
        let response = self
            .http
            .get(&url)
            .basic_auth(
                &self.config.vcenter_username,
                Some(&self.config.vcenter_password),
            )
            .header("Range", format!("bytes={}-{}", start, end))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NodeError::Vsphere(format!(
                "datastore read of {} returned {}",
                path,
                response.status()
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Pulls the VirtualDisk entries out of a hardware.device property value.
fn parse_disks(xml: &str) -> Vec<DiskRecord> {
    let mut disks: Vec<DiskRecord> = extract_typed_elements(xml, "VirtualDisk")
        .into_iter()
        .filter_map(|element| {
            let key = extract_tag(element, "key")?.parse::<i32>().ok()?;
            let unit_number = extract_tag(element, "unitNumber")
                .and_then(|u| u.parse::<i32>().ok())
                .unwrap_or(0);
            let capacity_bytes = extract_tag(element, "capacityInBytes")
                .and_then(|c| c.parse::<i64>().ok())
                .unwrap_or(0);
            let backing_file = extract_tag(element, "fileName").unwrap_or_default();
            let change_id = extract_tag(element, "changeId").filter(|c| !c.is_empty());

            Some(DiskRecord {
                key,
                unit_number,
                capacity_bytes,
                backing_file,
                change_id,
            })
        })
        .collect();

    disks.sort_by_key(|d| d.key);
    disks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_disks_from_a_device_array() {
        let xml = r#"<val xsi:type="ArrayOfVirtualDevice">
            <VirtualDevice xsi:type="VirtualDisk">
                <key>2001</key><unitNumber>1</unitNumber><capacityInBytes>5368709120</capacityInBytes>
                <backing xsi:type="VirtualDiskFlatVer2BackingInfo"><fileName>[ds1] beta/beta_1.vmdk</fileName><changeId>52 3e/7</changeId></backing>
            </VirtualDevice>
            <VirtualDevice xsi:type="VirtualDisk">
                <key>2000</key><unitNumber>0</unitNumber><capacityInBytes>107374182400</capacityInBytes>
                <backing xsi:type="VirtualDiskFlatVer2BackingInfo"><fileName>[ds1] beta/beta.vmdk</fileName></backing>
            </VirtualDevice>
            <VirtualDevice xsi:type="VirtualE1000"><key>4000</key></VirtualDevice>
        </val>"#;

        let disks = parse_disks(xml);
        assert_eq!(disks.len(), 2);
        // Sorted by key, so index order matches unit order.
        assert_eq!(disks[0].key, 2000);
        assert_eq!(disks[0].change_id, None);
        assert_eq!(disks[1].key, 2001);
        assert_eq!(disks[1].change_id.as_deref(), Some("52 3e/7"));
        assert_eq!(disks[1].capacity_bytes, 5 * 1024 * 1024 * 1024);
    }

    #[test]
    fn urlencode_escapes_spaces_and_brackets() {
        assert_eq!(urlencode("datastore 1"), "datastore%201");
        assert_eq!(urlencode("plain-name"), "plain-name");
    }
}
