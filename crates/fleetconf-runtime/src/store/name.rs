/// Suffix every managed config file must carry
pub const CONFIG_SUFFIX: &str = ".conf";

/// Whether `name` may be joined onto the config directory.
///
/// This is the only guard against path traversal: the directory is fixed and
/// names are appended to it verbatim.
pub fn is_valid_config_name(name: &str) -> bool {
    !name.is_empty()
        // The null byte is the only universally invalid character
        && !name.contains('\0')
        && !name.contains(['/', '\\'])
        && name.ends_with(CONFIG_SUFFIX)
}
