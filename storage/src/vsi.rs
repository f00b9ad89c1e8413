//! Helpers for composing GDAL-style virtual file system paths.

/// Joins a virtual path prefix (e.g. `/vsis3/bucket`) with a member location,
/// collapsing the slashes at the seam.
pub fn join(base: &str, location: &str) -> String {
    let location = location.trim_start_matches('/');
    if location.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return location.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), location)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    #[rstest]
    #[case("/vsis3/bucket", "a/b.tif", "/vsis3/bucket/a/b.tif")]
    #[case("/vsis3/bucket/", "/a/b.tif", "/vsis3/bucket/a/b.tif")]
    #[case("/vsis3", "", "/vsis3")]
    #[case("", "b.tif", "b.tif")]
    fn join(#[case] base: &str, #[case] location: &str, #[case] exp: &str) {
        assert_eq!(exp, super::join(base, location));
    }
}
