//! Btrfs subvolume bookkeeping: option strings, `btrfs subvolume list`
//! parsing and the `.subvolume_metadata` file kept at the filesystem root.

pub mod subvolume;

use anyhow::Result;

use crate::error::MountError;

pub use subvolume::BtrfsSubvolumeManager;

/// Written at the top of the btrfs filesystem, one line per subvolume.
pub const METADATA_FILE: &str = ".subvolume_metadata";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeSpec {
    /// In sectors.
    pub size: u64,
    pub disk: String,
    pub mountpoint: String,
    /// Mount options as requested, `subvol=` included.
    pub fsopts: String,
    pub name: String,
    pub boot: bool,
    pub mounted: bool,
    pub id: Option<u64>,
}

impl SubvolumeSpec {
    pub fn is_root(&self) -> bool {
        self.mountpoint == "/"
    }
}

/// Value of the `subvol=` option, if any.
pub fn subvolume_name(fsopts: &str) -> Option<&str> {
    fsopts
        .split(',')
        .find_map(|opt| opt.trim().strip_prefix("subvol="))
        .filter(|name| !name.is_empty())
}

/// Drops every `subvol=` option.
pub fn strip_subvol_options(fsopts: &str) -> String {
    fsopts
        .split(',')
        .map(str::trim)
        .filter(|opt| !opt.is_empty() && !opt.starts_with("subvol="))
        .collect::<Vec<_>>()
        .join(",")
}

/// Appends `extra` to an option string, either of which may be empty.
pub fn join_options(fsopts: &str, extra: &str) -> String {
    match (fsopts.is_empty(), extra.is_empty()) {
        (true, _) => extra.to_owned(),
        (false, true) => fsopts.to_owned(),
        (false, false) => format!("{fsopts},{extra}"),
    }
}

/// Finds the numeric ID of `name` in `btrfs subvolume list` output, whose
/// lines look like `ID 256 gen 7 top level 5 path root`.
pub fn parse_subvolume_id(list_output: &str, name: &str) -> Result<u64> {
    let suffix = format!(" path {name}");
    let line = list_output
        .lines()
        .map(str::trim_end)
        .find(|line| line.ends_with(&suffix))
        .ok_or_else(|| MountError::new(format!("Subvolume {name} not found")))?;

    let id = line.split_whitespace().nth(1).unwrap_or_default();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(MountError::new(format!(
            "Invalid subvolume ID '{id}' for {name} in line: {line}"
        ))
        .into());
    }
    Ok(id.parse()?)
}

/// One metadata line: `<id>\t<name>\t<mountpoint>\t<fsopts without subvol=>`.
pub fn format_metadata_line(subvolume: &SubvolumeSpec) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        subvolume.id.unwrap_or_default(),
        subvolume.name,
        subvolume.mountpoint,
        strip_subvol_options(&subvolume.fsopts)
    )
}

/// Rebuilds subvolumes of `disk` from metadata written by
/// [`format_metadata_line`]; `subvol=<name>` is put back into the options.
pub fn parse_metadata(content: &str, disk: &str, size: u64) -> Result<Vec<SubvolumeSpec>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.splitn(4, '\t').collect();
            let [id, name, mountpoint, fsopts] = fields[..] else {
                return Err(
                    MountError::new(format!("Malformed subvolume metadata line: {line}")).into(),
                );
            };
            let id = id
                .parse::<u64>()
                .map_err(|_| MountError::new(format!("Invalid subvolume ID in: {line}")))?;
            Ok(SubvolumeSpec {
                size,
                disk: disk.to_owned(),
                mountpoint: mountpoint.to_owned(),
                fsopts: join_options(fsopts, &format!("subvol={name}")),
                name: name.to_owned(),
                boot: false,
                mounted: false,
                id: Some(id),
            })
        })
        .collect()
}

#[cfg(test)]
pub mod tests {

    use rstest::rstest;

    use super::*;

    const SUBVOLUME_LIST: &str = "ID 256 gen 9 top level 5 path root
ID 257 gen 9 top level 5 path home
ID 258 gen 8 top level 5 path home_old
ID x59 gen 8 top level 5 path broken
";

    #[rstest]
    #[case("subvol=root", Some("root"))]
    #[case("compress=zlib,subvol=home", Some("home"))]
    #[case("subvol=", None)]
    #[case("defaults", None)]
    fn test_subvolume_name(#[case] fsopts: &str, #[case] expected: Option<&str>) {
        assert_eq!(subvolume_name(fsopts), expected);
    }

    #[test]
    fn test_strip_and_join_options() {
        assert_eq!(strip_subvol_options("compress=zlib,subvol=root,noatime"), "compress=zlib,noatime");
        assert_eq!(strip_subvol_options("subvol=root"), "");
        assert_eq!(join_options("", "subvolid=0"), "subvolid=0");
        assert_eq!(join_options("noatime", ""), "noatime");
        assert_eq!(join_options("noatime", "subvolid=0"), "noatime,subvolid=0");
    }

    #[test]
    fn test_parse_subvolume_id() -> Result<()> {
        assert_eq!(parse_subvolume_id(SUBVOLUME_LIST, "root")?, 256);
        // Must not match "home_old"
        assert_eq!(parse_subvolume_id(SUBVOLUME_LIST, "home")?, 257);
        assert_eq!(parse_subvolume_id(SUBVOLUME_LIST, "home_old")?, 258);

        let error = parse_subvolume_id(SUBVOLUME_LIST, "broken").unwrap_err();
        assert!(error.downcast_ref::<MountError>().is_some());
        assert!(parse_subvolume_id(SUBVOLUME_LIST, "var").is_err());
        Ok(())
    }

    #[test]
    fn test_metadata_reconstructs_subvolumes() -> Result<()> {
        let subvolumes = vec![
            SubvolumeSpec {
                size: 2048,
                disk: "sda".into(),
                mountpoint: "/".into(),
                fsopts: "compress=zlib,subvol=root".into(),
                name: "root".into(),
                boot: false,
                mounted: false,
                id: Some(256),
            },
            SubvolumeSpec {
                size: 2048,
                disk: "sda".into(),
                mountpoint: "/home".into(),
                fsopts: "subvol=home".into(),
                name: "home".into(),
                boot: false,
                mounted: false,
                id: Some(257),
            },
        ];

        let content: String = subvolumes
            .iter()
            .map(|subvolume| format_metadata_line(subvolume) + "\n")
            .collect();
        assert_eq!(
            content,
            "256\troot\t/\tcompress=zlib\n257\thome\t/home\t\n"
        );

        let parsed = parse_metadata(&content, "sda", 2048)?;
        assert_eq!(parsed, subvolumes);
        Ok(())
    }

    #[test]
    fn test_malformed_metadata() {
        assert!(parse_metadata("256\troot\n", "sda", 0).is_err());
        assert!(parse_metadata("abc\troot\t/\t\n", "sda", 0).is_err());
        assert!(parse_metadata("\n\n", "sda", 0).is_ok_and(|v| v.is_empty()));
    }
}
