// Minimal scanning of libvirt domain XML (disks, interfaces, identity)

/// Escape text for use in XML attributes and element bodies.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Every `<tag ...>...</tag>` (or self-closing `<tag .../>`) block, in document order.
pub fn element_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut pos = 0;
    while let Some(rel) = xml[pos..].find(&open) {
        let start = pos + rel;
        let after = start + open.len();
        let next = xml[after..].chars().next();
        if !matches!(next, Some(' ') | Some('>') | Some('/') | Some('\n') | Some('\t')) {
            pos = after;
            continue;
        }
        let Some(tag_end_rel) = xml[start..].find('>') else {
            break;
        };
        let tag_end = start + tag_end_rel + 1;
        if xml[..tag_end].ends_with("/>") {
            blocks.push(&xml[start..tag_end]);
            pos = tag_end;
            continue;
        }
        match xml[tag_end..].find(&close) {
            Some(c) => {
                let end = tag_end + c + close.len();
                blocks.push(&xml[start..end]);
                pos = end;
            }
            None => break,
        }
    }
    blocks
}

/// Attribute of the first `<tag ...>` inside `block`.
pub fn tag_attr(block: &str, tag: &str, name: &str) -> Option<String> {
    let first = element_blocks(block, tag).into_iter().next()?;
    let head_end = first.find('>')?;
    attr(&first[..head_end], name)
}

/// Attribute of the opening tag that starts `block`.
pub fn own_attr(block: &str, name: &str) -> Option<String> {
    let head_end = block.find('>')?;
    attr(&block[..head_end], name)
}

fn attr(head: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let needle = format!(" {}={}", name, quote);
        if let Some(i) = head.find(&needle) {
            let rest = &head[i + needle.len()..];
            let end = rest.find(quote)?;
            return Some(unescape(&rest[..end]));
        }
    }
    None
}

/// Body text of the first `<tag>text</tag>`.
pub fn text_of(xml: &str, tag: &str) -> Option<String> {
    let block = element_blocks(xml, tag).into_iter().next()?;
    let body_start = block.find('>')? + 1;
    let body_end = block.rfind("</")?;
    if body_end < body_start {
        return None;
    }
    let t = block[body_start..body_end].trim();
    if t.is_empty() { None } else { Some(unescape(t)) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDisk {
    /// "disk", "cdrom" or "floppy".
    pub device: String,
    pub source: Option<String>,
    pub target_dev: String,
    pub bus: Option<String>,
    pub secret_uuid: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInterface {
    pub mac: String,
    pub bridge: Option<String>,
    pub target_dev: Option<String>,
    pub raw: String,
}

pub fn parse_disks(xml: &str) -> Vec<DomainDisk> {
    element_blocks(xml, "disk")
        .into_iter()
        .map(|block| {
            let source = ["file", "dev", "name"]
                .iter()
                .find_map(|a| tag_attr(block, "source", a));
            let secret_uuid = element_blocks(block, "encryption")
                .into_iter()
                .next()
                .and_then(|enc| tag_attr(enc, "secret", "uuid"));
            DomainDisk {
                device: own_attr(block, "device").unwrap_or_else(|| "disk".into()),
                source,
                target_dev: tag_attr(block, "target", "dev").unwrap_or_default(),
                bus: tag_attr(block, "target", "bus"),
                secret_uuid,
                raw: block.to_string(),
            }
        })
        .collect()
}

pub fn parse_interfaces(xml: &str) -> Vec<DomainInterface> {
    element_blocks(xml, "interface")
        .into_iter()
        .map(|block| DomainInterface {
            mac: tag_attr(block, "mac", "address").unwrap_or_default(),
            bridge: tag_attr(block, "source", "bridge"),
            target_dev: tag_attr(block, "target", "dev"),
            raw: block.to_string(),
        })
        .collect()
}

pub fn domain_name(xml: &str) -> Option<String> {
    text_of(xml, "name")
}

pub fn domain_uuid(xml: &str) -> Option<String> {
    text_of(xml, "uuid")
}

pub fn vcpu_count(xml: &str) -> Option<u32> {
    let block = element_blocks(xml, "vcpu").into_iter().next()?;
    own_attr(block, "current")
        .or_else(|| text_of(block, "vcpu"))
        .and_then(|v| v.parse().ok())
}

pub fn memory_kib(xml: &str) -> Option<u64> {
    text_of(xml, "memory").and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = r#"<domain type='kvm'>
  <name>i-2-10-VM</name>
  <uuid>8b2c6a0e-1111-2222-3333-444455556666</uuid>
  <memory>1048576</memory>
  <vcpu current='2'>4</vcpu>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/mnt/pool/ROOT-10'/>
      <target dev='vda' bus='virtio'/>
      <encryption format='luks'>
        <secret type='passphrase' uuid='0f1e2d3c-aaaa-bbbb-cccc-ddddeeeeffff'/>
      </encryption>
    </disk>
    <disk type='file' device='cdrom'>
      <target dev='hdc' bus='ide'/>
    </disk>
    <interface type='bridge'>
      <mac address='02:00:4c:5f:00:01'/>
      <source bridge='cloudbr0'/>
      <target dev='vnet0'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn disks_are_parsed_in_order() {
        let disks = parse_disks(XML);
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].source.as_deref(), Some("/mnt/pool/ROOT-10"));
        assert_eq!(disks[0].bus.as_deref(), Some("virtio"));
        assert_eq!(
            disks[0].secret_uuid.as_deref(),
            Some("0f1e2d3c-aaaa-bbbb-cccc-ddddeeeeffff")
        );
        assert_eq!(disks[1].device, "cdrom");
        assert_eq!(disks[1].source, None);
    }

    #[test]
    fn interfaces_and_identity() {
        let nics = parse_interfaces(XML);
        assert_eq!(nics[0].mac, "02:00:4c:5f:00:01");
        assert_eq!(nics[0].bridge.as_deref(), Some("cloudbr0"));
        assert_eq!(domain_name(XML).as_deref(), Some("i-2-10-VM"));
        assert_eq!(vcpu_count(XML), Some(2));
        assert_eq!(memory_kib(XML), Some(1048576));
    }

    #[test]
    fn escape_round_trips_through_attr() {
        let head = format!("<source file='{}'", escape("/a/b'c&d"));
        assert_eq!(attr(&head, "file").as_deref(), Some("/a/b'c&d"));
    }
}
