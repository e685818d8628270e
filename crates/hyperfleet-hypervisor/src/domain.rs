//! Domain XML rendering and virsh output parsing.

use std::fmt::Write;

use hyperfleet_core::{
    GatewayError, GatewayResult, HostUtilization, InstanceTemplate, NetworkTemplate, VmStatus,
};

/// Name of the per-instance disk volume cloned from the group image.
pub fn volume_name(instance_id: &str) -> String {
    format!("{instance_id}.qcow2")
}

/// Name of the per-instance NoCloud seed volume.
pub fn seed_volume_name(instance_id: &str) -> String {
    format!("{instance_id}-cidata.iso")
}

/// KVM domain booting from a cloned volume in `pool`, with the NoCloud
/// seed attached as a cdrom when the template asks for guest setup.
pub fn render_domain_xml(instance_id: &str, template: &InstanceTemplate, pool: &str) -> String {
    let memory_kib = (template.resources.memory_bytes / 1024).max(1);
    let vcpus = template.resources.cpu_cores.max(1);
    let network = template
        .network
        .as_ref()
        .map_or("default", |n| n.network.as_str());
    let pool = xml_escape(pool);

    let mut seed = String::new();
    if template.wants_seed() {
        let _ = write!(
            seed,
            r#"
    <disk type='volume' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source pool='{pool}' volume='{volume}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>"#,
            volume = xml_escape(&seed_volume_name(instance_id)),
        );
    }

    let mut xml = String::new();
    // Writing to a String cannot fail.
    let _ = write!(
        xml,
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu>{vcpus}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features><acpi/><apic/></features>
  <cpu mode='host-passthrough'/>
  <devices>
    <disk type='volume' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source pool='{pool}' volume='{volume}'/>
      <target dev='vda' bus='virtio'/>
    </disk>{seed}
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <console type='pty'/>
  </devices>
  <metadata>
    <hyperfleet:instance xmlns:hyperfleet='https://hyperfleet.dev/xmlns/instance/1.0'>{name}</hyperfleet:instance>
  </metadata>
</domain>
"#,
        name = xml_escape(instance_id),
        volume = xml_escape(&volume_name(instance_id)),
        network = xml_escape(network),
    );
    xml
}

/// Files cloud-init's NoCloud datasource reads from the seed volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoCloudSeed {
    pub meta_data: String,
    pub user_data: String,
    pub network_config: Option<String>,
    pub vendor_data: Option<String>,
}

impl NoCloudSeed {
    /// `(file name, contents)` as laid out on the seed.
    pub fn files(&self) -> Vec<(&'static str, &str)> {
        let mut files = vec![
            ("meta-data", self.meta_data.as_str()),
            ("user-data", self.user_data.as_str()),
        ];
        if let Some(network) = &self.network_config {
            files.push(("network-config", network));
        }
        if let Some(vendor) = &self.vendor_data {
            files.push(("vendor-data", vendor));
        }
        files
    }
}

/// The seed for one instance, or `None` when the template has no guest setup.
///
/// Configured documents are used as given, except meta-data, which is
/// appended to the generated `instance-id` and `local-hostname` keys so
/// every instance keeps its own identity. Without a configured
/// network-config, one is generated from the template's networking.
pub fn render_seed(instance_id: &str, template: &InstanceTemplate) -> Option<NoCloudSeed> {
    if !template.wants_seed() {
        return None;
    }
    let cloud_init = template.cloud_init.clone().unwrap_or_default();
    let fqdn = template
        .domain_name
        .as_ref()
        .map(|domain| format!("{instance_id}.{domain}"));

    let mut meta_data = format!(
        "instance-id: {instance_id}\nlocal-hostname: {}\n",
        fqdn.as_deref().unwrap_or(instance_id)
    );
    if let Some(extra) = &cloud_init.meta_data {
        meta_data.push_str(extra);
        if !extra.ends_with('\n') {
            meta_data.push('\n');
        }
    }

    let user_data = cloud_init.user_data.unwrap_or_else(|| {
        let mut doc = format!("#cloud-config\nhostname: {instance_id}\n");
        if let Some(fqdn) = &fqdn {
            let _ = writeln!(doc, "fqdn: {fqdn}");
        }
        doc
    });

    let network_config = cloud_init
        .network_data
        .or_else(|| template.network.as_ref().and_then(netplan));

    Some(NoCloudSeed {
        meta_data,
        user_data,
        network_config,
        vendor_data: cloud_init.vendor_data,
    })
}

/// Netplan v2 network-config for the instance's one NIC. A static
/// template without an assigned address yields nothing.
fn netplan(net: &NetworkTemplate) -> Option<String> {
    let mut doc = String::from("version: 2\nethernets:\n  primary:\n    match:\n      name: \"e*\"\n");
    if net.dhcp {
        doc.push_str("    dhcp4: true\n");
        return Some(doc);
    }
    let address = net.address?;
    let prefix = net.prefix_len()?;
    let _ = writeln!(doc, "    dhcp4: false\n    addresses:\n      - {address}/{prefix}");
    if let Some(gateway) = net.gateway {
        let _ = writeln!(doc, "    routes:\n      - to: default\n        via: {gateway}");
    }
    Some(doc)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// Map `virsh domstate` output onto the gateway's status.
///
/// Only a running domain counts as `Running`. Paused, shut-off or crashed
/// domains are reported as errors so the engine keeps polling and retry
/// accounting applies.
pub fn parse_domstate(stdout: &str) -> GatewayResult<VmStatus> {
    let state = stdout.trim().to_ascii_lowercase();
    match state.as_str() {
        "running" | "idle" | "blocked" | "no state" => Ok(VmStatus::Running),
        "" => Err(GatewayError::Protocol("empty domstate output".into())),
        other => Err(GatewayError::Rejected(format!("domain is {other}"))),
    }
}

fn field_value<'a>(stdout: &'a str, key: &str) -> Option<&'a str> {
    stdout.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim().eq_ignore_ascii_case(key)).then(|| v.trim())
    })
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim_end_matches("KiB")
        .trim_end_matches('%')
        .trim()
        .parse()
        .ok()
}

/// CPU utilization fraction from `virsh nodecpustats --percent`.
pub fn parse_nodecpustats(stdout: &str) -> GatewayResult<f64> {
    if let Some(usage) = field_value(stdout, "usage").and_then(parse_number) {
        return Ok((usage / 100.0).clamp(0.0, 1.0));
    }
    if let Some(idle) = field_value(stdout, "idle").and_then(parse_number) {
        return Ok((1.0 - idle / 100.0).clamp(0.0, 1.0));
    }
    Err(GatewayError::Protocol(format!(
        "nodecpustats: no usage or idle field in {:?}",
        stdout.trim()
    )))
}

/// Memory utilization fraction from `virsh nodememstats`.
///
/// Page cache and buffers count as available.
pub fn parse_nodememstats(stdout: &str) -> GatewayResult<f64> {
    let get = |key| field_value(stdout, key).and_then(parse_number);
    let total = get("total")
        .filter(|t| *t > 0.0)
        .ok_or_else(|| GatewayError::Protocol("nodememstats: missing total".into()))?;
    let free = get("free")
        .ok_or_else(|| GatewayError::Protocol("nodememstats: missing free".into()))?;
    let reclaimable = get("buffers").unwrap_or(0.0) + get("cached").unwrap_or(0.0);
    Ok((1.0 - (free + reclaimable) / total).clamp(0.0, 1.0))
}

pub fn utilization(cpu_stdout: &str, mem_stdout: &str) -> GatewayResult<HostUtilization> {
    Ok(HostUtilization {
        cpu: parse_nodecpustats(cpu_stdout)?,
        memory: parse_nodememstats(mem_stdout)?,
    })
}
