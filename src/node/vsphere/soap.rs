//! SOAP plumbing for the vSphere SDK endpoint: envelope construction and
//! the small amount of XML extraction the client needs. Responses are
//! scanned tag-wise; the subset of vim25 we touch is flat enough that a
//! full XML parse buys nothing.

pub const SOAP_NS: &str = "urn:vim25";

/// Wraps a body fragment in the SOAP envelope vCenter expects.
pub fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:urn="{}">
<soapenv:Body>
{}
</soapenv:Body>
</soapenv:Envelope>"#,
        SOAP_NS, body
    )
}

/// Escapes text destined for element content or attribute values.
pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// First occurrence of `<tag ...>content</tag>`, content returned raw.
pub fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    extract_all_tags(xml, tag).into_iter().next()
}

/// Every occurrence of a tag's content, in document order. Handles both
/// plain (`<key>`) and attributed (`<key attr="...">`) opening forms.
pub fn extract_all_tags(xml: &str, tag: &str) -> Vec<String> {
    let close = format!("</{}>", tag);
    let mut results = Vec::new();
    let mut cursor = 0usize;

    while let Some(rel_start) = xml[cursor..].find(&format!("<{}", tag)) {
        let start = cursor + rel_start;
        let after_name = start + 1 + tag.len();

        // Must be a real tag boundary, not a prefix of a longer name.
        match xml.as_bytes().get(after_name) {
            Some(b'>') | Some(b' ') | Some(b'/') => {}
            _ => {
                cursor = after_name;
                continue;
            }
        }

        let Some(open_end) = xml[start..].find('>') else {
            break;
        };
        let content_start = start + open_end + 1;

        if xml.as_bytes().get(start + open_end - 1) == Some(&b'/') {
            // Self-closing tag
            results.push(String::new());
            cursor = content_start;
            continue;
        }

        let Some(rel_close) = xml[content_start..].find(&close) else {
            break;
        };
        results.push(xml[content_start..content_start + rel_close].to_string());
        cursor = content_start + rel_close + close.len();
    }

    results
}

/// Slices out every element annotated with the given xsi:type, e.g. the
/// `VirtualDisk` entries inside a `config.hardware.device` array.
pub fn extract_typed_elements<'a>(xml: &'a str, type_name: &str) -> Vec<&'a str> {
    let marker = format!("xsi:type=\"{}\"", type_name);
    let mut results = Vec::new();
    let mut cursor = 0usize;

    while let Some(rel_marker) = xml[cursor..].find(&marker) {
        let marker_pos = cursor + rel_marker;

        // Walk back to the element's opening '<' and grab its tag name.
        let Some(open_pos) = xml[..marker_pos].rfind('<') else {
            break;
        };
        let tag_name: String = xml[open_pos + 1..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();

        let close = format!("</{}>", tag_name);
        let Some(rel_close) = xml[marker_pos..].find(&close) else {
            cursor = marker_pos + marker.len();
            continue;
        };
        let end = marker_pos + rel_close + close.len();
        results.push(&xml[open_pos..end]);
        cursor = end;
    }

    results
}

/// True when the response carries a SOAP fault.
pub fn is_fault(xml: &str) -> bool {
    xml.contains(":Fault>") || xml.contains("<faultstring>")
}

/// Human-readable fault detail for error messages.
pub fn fault_string(xml: &str) -> String {
    extract_tag(xml, "faultstring").unwrap_or_else(|| "unknown SOAP fault".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_and_repeated_tags() {
        let xml = "<a><name>x</name><name>y</name></a>";
        assert_eq!(extract_tag(xml, "name"), Some("x".to_string()));
        assert_eq!(extract_all_tags(xml, "name"), vec!["x", "y"]);
    }

    #[test]
    fn tag_prefixes_do_not_match() {
        let xml = "<names>wrong</names><name>right</name>";
        assert_eq!(extract_tag(xml, "name"), Some("right".to_string()));
    }

    #[test]
    fn attributed_tags_are_extracted() {
        let xml = r#"<returnval type="Task">task-42</returnval>"#;
        assert_eq!(extract_tag(xml, "returnval"), Some("task-42".to_string()));
    }

    #[test]
    fn typed_elements_are_sliced_whole() {
        let xml = r#"<device><VirtualDevice xsi:type="VirtualDisk"><key>2000</key></VirtualDevice><VirtualDevice xsi:type="VirtualE1000"><key>4000</key></VirtualDevice></device>"#;
        let disks = extract_typed_elements(xml, "VirtualDisk");
        assert_eq!(disks.len(), 1);
        assert!(disks[0].contains("<key>2000</key>"));
    }

    #[test]
    fn faults_are_detected_and_described() {
        let xml = "<soapenv:Fault><faultstring>The session is not authenticated</faultstring></soapenv:Fault>";
        assert!(is_fault(xml));
        assert_eq!(fault_string(xml), "The session is not authenticated");
    }

    #[test]
    fn escaping_covers_the_five_reserved_characters() {
        assert_eq!(xml_escape(r#"a<b>&"c'"#), "a&lt;b&gt;&amp;&quot;c&apos;");
    }
}
