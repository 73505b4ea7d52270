//! Volume naming
//!
//! Volume names are an FNV-1a hash of the device entry, node and
//! StorageClass, so rediscovering a device always yields the same name.

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// Prefix of every generated volume name
pub const VOLUME_NAME_PREFIX: &str = "local-pv";

/// Prefix of the provisioner identity stored on created volumes
pub const PROVISIONER_NAME_PREFIX: &str = "local-volume-provisioner";

pub(crate) fn fnv1a32(parts: &[&str]) -> u32 {
    let mut hash = FNV32_OFFSET_BASIS;
    for part in parts {
        for byte in part.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(FNV32_PRIME);
        }
    }
    hash
}

/// Deterministic volume name for a directory entry on a node
pub fn generate_pv_name(entry: &str, node_name: &str, storage_class: &str) -> String {
    format!(
        "{}-{:x}",
        VOLUME_NAME_PREFIX,
        fnv1a32(&[entry, node_name, storage_class])
    )
}

/// Identity of the agent on a node.
///
/// With `use_node_name_only` the node UID is left out, so an agent keeps its
/// identity when the Node object is recreated.
pub fn provisioner_name(node_name: &str, node_uid: &str, use_node_name_only: bool) -> String {
    if use_node_name_only || node_uid.is_empty() {
        format!("{}-{}", PROVISIONER_NAME_PREFIX, node_name)
    } else {
        format!("{}-{}-{}", PROVISIONER_NAME_PREFIX, node_name, node_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_pv_name() {
        assert_eq!(
            generate_pv_name("mount1", "test-node", "sc1"),
            "local-pv-aaaafef5"
        );
        assert_eq!(
            generate_pv_name("mount2", "test-node", "sc1"),
            "local-pv-79412c38"
        );
        assert_eq!(
            generate_pv_name("symlink1", "test-node", "sc2"),
            "local-pv-55d5adba"
        );
    }

    #[test]
    fn test_generate_pv_name_is_stable() {
        let first = generate_pv_name("d1", "n1", "sc1");
        for _ in 0..10 {
            assert_eq!(generate_pv_name("d1", "n1", "sc1"), first);
        }
        assert_ne!(first, generate_pv_name("d1", "n2", "sc1"));
        assert_ne!(first, generate_pv_name("d1", "n1", "sc2"));
    }

    #[test]
    fn test_provisioner_name() {
        assert_eq!(
            provisioner_name("node-a", "1234", false),
            "local-volume-provisioner-node-a-1234"
        );
        assert_eq!(
            provisioner_name("node-a", "1234", true),
            "local-volume-provisioner-node-a"
        );
    }
}
