/// First byte of a JNI type signature, which doubles as the JDWP value tag.
pub fn signature_to_tag(signature: &str) -> u8 {
    signature.as_bytes().first().copied().unwrap_or(b'V')
}

pub fn is_primitive_tag(tag: u8) -> bool {
    matches!(
        tag,
        b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D' | b'V'
    )
}

/// Convert a JNI signature (`[Ljava/lang/String;`) to its Java source form
/// (`java.lang.String[]`).
pub fn signature_to_type_name(signature: &str) -> String {
    let mut sig = signature;
    let mut dims = 0usize;
    while let Some(rest) = sig.strip_prefix('[') {
        dims += 1;
        sig = rest;
    }

    let base = if let Some(class) = sig.strip_prefix('L').and_then(|s| s.strip_suffix(';')) {
        class.replace('/', ".")
    } else {
        match sig.as_bytes().first().copied() {
            Some(b'B') => "byte".to_string(),
            Some(b'C') => "char".to_string(),
            Some(b'D') => "double".to_string(),
            Some(b'F') => "float".to_string(),
            Some(b'I') => "int".to_string(),
            Some(b'J') => "long".to_string(),
            Some(b'S') => "short".to_string(),
            Some(b'Z') => "boolean".to_string(),
            Some(b'V') => "void".to_string(),
            _ => "<unknown>".to_string(),
        }
    };

    let mut out = base;
    for _ in 0..dims {
        out.push_str("[]");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_first_signature_byte() {
        assert_eq!(signature_to_tag("I"), b'I');
        assert_eq!(signature_to_tag("[I"), b'[');
        assert_eq!(signature_to_tag("Ljava/util/List;"), b'L');
        assert_eq!(signature_to_tag(""), b'V');
    }

    #[test]
    fn type_names_follow_java_source_syntax() {
        assert_eq!(signature_to_type_name("I"), "int");
        assert_eq!(signature_to_type_name("[[J"), "long[][]");
        assert_eq!(
            signature_to_type_name("[Ljava/lang/String;"),
            "java.lang.String[]"
        );
        assert_eq!(signature_to_type_name("Q"), "<unknown>");
    }
}
