//! Libvirt domain XML encoding.
//!
//! [`render`] turns a [`DomainDescriptor`] into the XML accepted by
//! `virsh create`. [`target_devices`] goes the other way just far enough to
//! find the interface and disk target names the stats collector needs.

use std::fmt::{self, Write as _};

use super::{
    ClockOffset, Controller, DiskDescriptor, DiskType, DomainDescriptor, Firmware,
    InterfaceDescriptor, IoDriver, TpmVersion,
};

/// Render the descriptor as libvirt domain XML.
///
/// Output is deterministic: identical descriptors produce identical bytes.
#[must_use]
pub fn render(d: &DomainDescriptor) -> String {
    let mut w = XmlWriter::default();

    w.element("domain").attr("type", d.header.hypervisor).open();
    w.element("name").text(&d.header.name);
    w.element("uuid").text(d.header.uuid);
    w.element("description").text(&d.header.description);

    let res = &d.resources;
    w.element("memory").attr("unit", "KiB").text(res.max_memory_kib);
    w.element("currentMemory").attr("unit", "KiB").text(res.current_memory_kib);
    w.element("vcpu")
        .attr("placement", "static")
        .attr("current", res.current_vcpus)
        .text(res.max_vcpus);

    w.element("cputune").open();
    w.element("shares").text(d.cpu_tune.shares);
    if d.cpu_tune.is_limited() {
        w.element("period").text(d.cpu_tune.period);
        w.element("quota").text(d.cpu_tune.quota);
    }
    w.close();

    let smbios = &d.guest.smbios;
    w.element("sysinfo").attr("type", "smbios").open();
    w.element("system").open();
    w.element("entry").attr("name", "manufacturer").text(&smbios.manufacturer);
    w.element("entry").attr("name", "product").text(&smbios.product);
    w.element("entry").attr("name", "uuid").text(smbios.uuid);
    w.close();
    w.close();

    w.element("os").open();
    w.element("type")
        .attr("arch", d.guest.arch)
        .attr("machine", d.guest.machine.as_str())
        .text("hvm");
    if let Firmware::Uefi { secure, loader, nvram } = &d.guest.firmware {
        w.element("loader")
            .attr("readonly", "yes")
            .attr("secure", if *secure { "yes" } else { "no" })
            .attr("type", "pflash")
            .text(loader.display());
        w.element("nvram").text(nvram.display());
    }
    w.element("boot").attr("dev", "cdrom").empty();
    w.element("boot").attr("dev", "hd").empty();
    w.element("smbios").attr("mode", "sysinfo").empty();
    w.close();

    w.element("features").open();
    if d.features.acpi {
        w.element("acpi").empty();
    }
    if d.features.apic {
        w.element("apic").empty();
    }
    if d.features.pae {
        w.element("pae").empty();
    }
    if d.features.smm {
        w.element("smm").attr("state", "on").empty();
    }
    w.close();

    let numa = &res.numa;
    w.element("cpu").open();
    w.element("numa").open();
    w.element("cell")
        .attr("id", numa.id)
        .attr("cpus", numa.cpu_range())
        .attr("memory", numa.memory_kib)
        .attr("unit", "KiB")
        .empty();
    w.close();
    w.close();

    w.element("clock")
        .attr(
            "offset",
            match d.clock {
                ClockOffset::Utc => "utc",
                ClockOffset::Localtime => "localtime",
            },
        )
        .empty();
    w.element("on_poweroff").text("destroy");
    w.element("on_reboot").text("restart");
    w.element("on_crash").text("destroy");

    render_devices(&mut w, d);

    w.close();
    w.finish()
}

fn render_devices(w: &mut XmlWriter, d: &DomainDescriptor) {
    let dev = &d.devices;
    w.element("devices").open();

    if let Some(emulator) = &dev.emulator {
        w.element("emulator").text(emulator.display());
    }
    for disk in &dev.disks {
        render_disk(w, disk);
    }
    for nic in &dev.interfaces {
        render_interface(w, nic);
    }
    for controller in &dev.controllers {
        let (kind, model) = match controller {
            Controller::UsbXhci => ("usb", "qemu-xhci"),
            Controller::VirtioScsi => ("scsi", "virtio-scsi"),
        };
        w.element("controller").attr("type", kind).attr("index", 0).attr("model", model).empty();
    }

    w.element("serial").attr("type", "pty").open();
    w.element("target").attr("port", 0).empty();
    w.close();
    w.element("console").attr("type", "pty").open();
    w.element("target").attr("type", "serial").attr("port", 0).empty();
    w.close();

    w.element("channel").attr("type", "unix").open();
    w.element("source")
        .attr("mode", "bind")
        .attr("path", dev.guest_agent_socket.display())
        .empty();
    w.element("target").attr("type", "virtio").attr("name", "org.qemu.guest_agent.0").empty();
    w.close();

    let gfx = &dev.graphics;
    w.element("graphics")
        .attr("type", "vnc")
        .attr("autoport", if gfx.autoport { "yes" } else { "no" })
        .attr("listen", &gfx.listen)
        .attr("passwd", &gfx.password)
        .open();
    w.element("listen").attr("type", "address").attr("address", &gfx.listen).empty();
    w.close();

    w.element("input").attr("type", "tablet").attr("bus", "usb").empty();
    w.element("watchdog").attr("model", "i6300esb").attr("action", "none").empty();

    w.element("rng").attr("model", "virtio").open();
    w.element("rate")
        .attr("period", dev.rng.rate_period_ms)
        .attr("bytes", dev.rng.rate_bytes)
        .empty();
    w.element("backend").attr("model", "random").text(dev.rng.source.display());
    w.close();

    if let Some(version) = dev.tpm {
        let model = match version {
            TpmVersion::V1_2 => "tpm-tis",
            TpmVersion::V2_0 => "tpm-crb",
        };
        w.element("tpm").attr("model", model).open();
        w.element("backend").attr("type", "emulator").attr("version", version.as_str()).empty();
        w.close();
    }

    match dev.memballoon {
        Some(balloon) => {
            w.element("memballoon").attr("model", "virtio").open();
            w.element("stats").attr("period", balloon.stats_period_secs).empty();
            w.close();
        }
        None => w.element("memballoon").attr("model", "none").empty(),
    }

    w.close();
}

fn render_disk(w: &mut XmlWriter, disk: &DiskDescriptor) {
    w.element("disk")
        .attr("type", disk.disk_type.as_str())
        .attr("device", disk.device.as_str())
        .open();

    let mut driver = w
        .element("driver")
        .attr("name", "qemu")
        .attr("type", disk.format.as_str())
        .attr("cache", "none")
        .attr("discard", disk.discard.as_str());
    if disk.io == IoDriver::IoUring {
        driver = driver.attr("io", "io_uring");
    }
    driver.empty();

    match disk.disk_type {
        DiskType::File => {
            w.element("source").attr("file", disk.source.display()).empty();
        }
        DiskType::Block => {
            w.element("source").attr("dev", disk.source.display()).empty();
        }
        DiskType::Network(protocol) => {
            w.element("source")
                .attr("protocol", protocol.as_str())
                .attr("name", disk.source.display())
                .open();
            for host in &disk.hosts {
                let mut el = w.element("host").attr("name", &host.name);
                if let Some(port) = host.port {
                    el = el.attr("port", port);
                }
                el.empty();
            }
            w.close();
        }
    }

    w.element("target").attr("dev", &disk.label).attr("bus", disk.bus.as_str()).empty();
    if disk.read_only {
        w.element("readonly").empty();
    }
    w.close();
}

fn render_interface(w: &mut XmlWriter, nic: &InterfaceDescriptor) {
    w.element("interface").attr("type", "bridge").open();
    w.element("mac").attr("address", &nic.mac).empty();
    w.element("source").attr("bridge", &nic.bridge).empty();
    if let Some(tag) = nic.vlan {
        w.element("vlan").open();
        w.element("tag").attr("id", tag).empty();
        w.close();
    }
    if let Some(target) = &nic.target_dev {
        w.element("target").attr("dev", target).empty();
    }
    w.element("model").attr("type", nic.model.as_str()).empty();
    if let Some(mtu) = nic.mtu {
        w.element("mtu").attr("size", mtu).empty();
    }
    w.close();
}

#[derive(Default)]
struct XmlWriter {
    out: String,
    stack: Vec<&'static str>,
}

impl XmlWriter {
    fn element(&mut self, name: &'static str) -> Element<'_> {
        self.indent();
        self.out.push('<');
        self.out.push_str(name);
        Element { writer: self, name }
    }

    fn close(&mut self) {
        if let Some(name) = self.stack.pop() {
            self.indent();
            let _ = writeln!(self.out, "</{name}>");
        }
    }

    fn finish(mut self) -> String {
        while !self.stack.is_empty() {
            self.close();
        }
        self.out
    }

    fn indent(&mut self) {
        for _ in 0..self.stack.len() {
            self.out.push_str("  ");
        }
    }
}

struct Element<'w> {
    writer: &'w mut XmlWriter,
    name: &'static str,
}

impl Element<'_> {
    fn attr(self, key: &str, value: impl fmt::Display) -> Self {
        let value = value.to_string();
        let _ = write!(self.writer.out, " {key}='{}'", escape(&value));
        self
    }

    fn open(self) {
        self.writer.out.push_str(">\n");
        self.writer.stack.push(self.name);
    }

    fn empty(self) {
        self.writer.out.push_str("/>\n");
    }

    fn text(self, text: impl fmt::Display) {
        let text = text.to_string();
        let _ = writeln!(self.writer.out, ">{}</{}>", escape(&text), self.name);
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Target device names found in a live domain XML.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDevices {
    /// Host-side tap names of the interfaces.
    pub interfaces: Vec<String>,
    /// Guest-side names of the non-CD-ROM disks.
    pub disks: Vec<String>,
}

/// Extract interface and disk target names from domain XML.
///
/// This is not a general XML parser; it understands the flat layout libvirt
/// emits for `<interface>` and `<disk>` elements.
#[must_use]
pub fn target_devices(xml: &str) -> TargetDevices {
    let interfaces = blocks(xml, "interface")
        .filter_map(|(_, body)| target_dev(body))
        .collect();
    let disks = blocks(xml, "disk")
        .filter(|(open_tag, _)| attr(open_tag, "device").unwrap_or("disk") == "disk")
        .filter_map(|(_, body)| target_dev(body))
        .collect();
    TargetDevices { interfaces, disks }
}

/// Yields `(opening tag, body)` for every `<name ...>...</name>` element.
fn blocks<'a>(xml: &'a str, name: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut rest = xml;
    std::iter::from_fn(move || loop {
        let start = rest.find(&open)?;
        let after = &rest[start + open.len()..];
        if !after.starts_with(|c: char| c.is_whitespace() || c == '>') {
            rest = after;
            continue;
        }
        let tag_end = after.find('>')?;
        let open_tag = &after[..tag_end];
        let body_start = &after[tag_end + 1..];
        let end = body_start.find(&close)?;
        rest = &body_start[end + close.len()..];
        return Some((open_tag, &body_start[..end]));
    })
}

fn target_dev(body: &str) -> Option<String> {
    let start = body.find("<target")?;
    let tag = &body[start..];
    let end = tag.find('>')?;
    attr(&tag[..end], "dev").map(str::to_owned)
}

fn attr<'a>(tag: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!(" {key}=");
    let pos = tag.find(&needle)?;
    let value = &tag[pos + needle.len()..];
    let quote = value.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let value = &value[1..];
    value.find(quote).map(|end| &value[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_XML: &str = r#"<domain type='kvm' id='7'>
  <name>i-2-17-VM</name>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/mnt/p1/root.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <target dev='hdd' bus='ide'/>
      <readonly/>
    </disk>
    <disk type="network" device="disk">
      <source protocol="rbd" name="cloudstack/a1"/>
      <target dev="vdb" bus="virtio"/>
    </disk>
    <interface type='bridge'>
      <mac address='02:00:4c:5e:00:11'/>
      <source bridge='cloudbr1'/>
      <target dev='vnet3'/>
      <model type='virtio'/>
    </interface>
    <interfaces-are-not-interfaces/>
  </devices>
</domain>"#;

    #[test]
    fn target_devices_skips_cdroms() {
        let devices = target_devices(LIVE_XML);
        assert_eq!(devices.disks, vec!["vda".to_owned(), "vdb".to_owned()]);
        assert_eq!(devices.interfaces, vec!["vnet3".to_owned()]);
    }

    #[test]
    fn target_devices_of_empty_xml_is_empty() {
        assert_eq!(target_devices(""), TargetDevices::default());
    }

    #[test]
    fn attribute_values_are_escaped() {
        let mut w = XmlWriter::default();
        w.element("graphics").attr("passwd", "a'b<c&").empty();
        assert_eq!(w.finish(), "<graphics passwd='a&apos;b&lt;c&amp;'/>\n");
    }

    #[test]
    fn nested_elements_are_indented_and_closed() {
        let mut w = XmlWriter::default();
        w.element("devices").open();
        w.element("input").attr("type", "tablet").empty();
        let out = w.finish();
        assert_eq!(out, "<devices>\n  <input type='tablet'/>\n</devices>\n");
    }
}
