// Line and path conventions
//
// The engine speaks 1-based lines and plain filesystem paths. The client
// picks its own conventions in `initialize`.

use tracing::warn;

const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conventions {
    pub debugger_lines_start_at1: bool,
    pub client_lines_start_at1: bool,
    pub debugger_paths_are_uri: bool,
    pub client_paths_are_uri: bool,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            debugger_lines_start_at1: true,
            client_lines_start_at1: true,
            debugger_paths_are_uri: false,
            client_paths_are_uri: false,
        }
    }
}

impl Conventions {
    pub fn to_client_line(&self, line: i64) -> i64 {
        match (self.debugger_lines_start_at1, self.client_lines_start_at1) {
            (true, false) => line - 1,
            (false, true) => line + 1,
            _ => line,
        }
    }

    pub fn to_debugger_line(&self, line: i64) -> i64 {
        match (self.debugger_lines_start_at1, self.client_lines_start_at1) {
            (true, false) => line + 1,
            (false, true) => line - 1,
            _ => line,
        }
    }

    pub fn to_client_path(&self, path: &str) -> Option<String> {
        convert_path(path, self.debugger_paths_are_uri, self.client_paths_are_uri)
    }

    pub fn to_debugger_path(&self, path: &str) -> Option<String> {
        convert_path(path, self.client_paths_are_uri, self.debugger_paths_are_uri)
    }
}

fn convert_path(path: &str, from_uri: bool, to_uri: bool) -> Option<String> {
    match (from_uri, to_uri) {
        (false, true) => Some(path_to_uri(path)),
        (true, false) => uri_to_path(path),
        _ => Some(path.to_string()),
    }
}

pub fn path_to_uri(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let encoded = normalized
        .split('/')
        .map(|segment| {
            // Keep drive letters like "C:" readable
            if segment.len() == 2 && segment.ends_with(':') {
                segment.to_string()
            } else {
                urlencoding::encode(segment).into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/");

    if encoded.starts_with('/') {
        format!("{}{}", FILE_SCHEME, encoded)
    } else {
        format!("{}/{}", FILE_SCHEME, encoded)
    }
}

pub fn uri_to_path(uri: &str) -> Option<String> {
    let Some(rest) = uri.strip_prefix(FILE_SCHEME) else {
        warn!("Not a file URI: {}", uri);
        return None;
    };

    let decoded = match urlencoding::decode(rest) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            warn!("Malformed URI {}: {}", uri, e);
            return None;
        }
    };

    // file:///C:/x -> C:/x
    let bytes = decoded.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[2] == b':' && bytes[1].is_ascii_alphabetic() {
        return Some(decoded[1..].to_string());
    }

    Some(decoded)
}
