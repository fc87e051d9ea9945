use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, Header};

/// Files to put in a snapshot archive: `(path, mode, contents)`.
pub type ArchiveEntry<'a> = (&'a str, u32, &'a [u8]);

/// Write a gzip-compressed snapshot archive into `dir` and return its path.
pub fn write_snapshot(dir: &Path, name: &str, entries: &[ArchiveEntry<'_>]) -> PathBuf {
    let path = dir.join(format!("{name}.tar.gz"));
    let file = File::create(&path).expect("create archive");
    let mut builder = Builder::new(GzEncoder::new(file, Compression::fast()));

    for (entry_path, mode, contents) in entries {
        let mut header = Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder
            .append_data(&mut header, entry_path, *contents)
            .expect("append entry");
    }

    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
    path
}

/// A minimal image: an executable `run` script plus a data file.
pub fn write_basic_snapshot(dir: &Path, name: &str) -> PathBuf {
    write_snapshot(
        dir,
        name,
        &[
            ("run", 0o755, b"#!/bin/sh\necho ready\n"),
            ("data/hello.txt", 0o644, b"hello from the image\n"),
        ],
    )
}

/// An archive whose single entry tries to escape the extraction root.
///
/// `tar::Builder` refuses `..` paths, so the name is written into the
/// header bytes directly.
pub fn write_escaping_snapshot(dir: &Path) -> PathBuf {
    let path = dir.join("evil.tar");
    let file = File::create(&path).expect("create archive");
    let mut builder = Builder::new(file);

    let contents = b"owned";
    let mut header = Header::new_old();
    {
        let name = b"../escaped.txt";
        let raw = header.as_old_mut();
        raw.name[..name.len()].copy_from_slice(name);
    }
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, &contents[..])
        .expect("append entry");
    builder.into_inner().expect("finish tar");
    path
}
