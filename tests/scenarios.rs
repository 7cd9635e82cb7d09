//! End-to-end scenarios over complete archives: build with the writer,
//! reopen, and check the read surface and format invariants.

use tempfile::TempDir;
use zim_core::{
    CompressionRegistry, CompressionType, Entry, Item, OpenMode, Policy, Uuid, Zim, ZimError,
};

fn archive_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("test.zim")
}

fn item(namespace: u8, url: &str, title: &str, content: &[u8]) -> Item {
    Item {
        namespace,
        url: url.to_string(),
        title: title.to_string(),
        mimetype: "text/plain".to_string(),
        content: content.to_vec(),
    }
}

/// Three entries, fixed UUID; the smallest interesting archive.
fn build_three_entry_archive(dir: &TempDir) -> std::path::PathBuf {
    let path = archive_path(dir);
    let zim = Zim::create(&path).unwrap();
    zim.set_uuid(Uuid::from_u128(1)).unwrap();
    zim.add_item(item(b'A', "index", "Index", b"<html>index</html>"))
        .unwrap();
    zim.add_item(item(b'C', "hello", "Hello", b"Hello\n")).unwrap();
    zim.add_item(item(b'C', "world", "World", b"World\n")).unwrap();
    zim.close().unwrap();
    path
}

#[test]
fn s1_open_known_archive_and_read() {
    let dir = TempDir::new().unwrap();
    let path = build_three_entry_archive(&dir);

    let zim = Zim::open(&path, OpenMode::Read).unwrap();
    assert_eq!(zim.header().entry_count, 3);
    assert_eq!(zim.uuid(), Uuid::from_u128(1));

    let entry = zim.get_content_entry_by_url("hello").unwrap();
    assert_eq!(entry.read().unwrap(), b"Hello\n");
    assert_eq!(entry.mimetype().unwrap(), "text/plain");
    assert_eq!(entry.title(), "Hello");
    assert_eq!(entry.full_url(), "Chello");
}

#[test]
fn s2_redirect_resolution() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    {
        let zim = Zim::create(&path).unwrap();
        zim.add_item(item(b'C', "index", "Index", b"the index")).unwrap();
        zim.add_redirect(b'C', "home", "Home", b'C', "index").unwrap();
        zim.close().unwrap();
    }

    let zim = Zim::open(&path, OpenMode::Read).unwrap();
    let home = zim.get_entry_by_url(b'C', "home").unwrap();
    assert!(home.is_redirect());
    assert_eq!(home.mimetype().unwrap(), "<redirect>");

    let resolved = zim.resolve(&home).unwrap();
    assert!(!resolved.is_redirect());
    assert_eq!(resolved.url(), "index");
    assert_eq!(resolved.read().unwrap(), b"the index");

    // read() on the redirect resolves transparently
    assert_eq!(home.read().unwrap(), b"the index");
}

#[cfg(feature = "zstd")]
#[test]
fn s3_missing_codec_fails_only_affected_clusters() {
    use zim_core::ClusterBuilder;

    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    {
        let zim = Zim::create(&path).unwrap();
        for (i, (url, compression)) in [
            ("a", CompressionType::Xz),
            ("b", CompressionType::None),
            ("c", CompressionType::Zstd),
        ]
        .iter()
        .enumerate()
        {
            let mut builder = ClusterBuilder::new(*compression);
            let blob = builder.push_blob(format!("content {i}").into_bytes());
            let cluster = zim.add_cluster(&builder).unwrap();
            zim.add_entry(Entry::content(0, b'C', *url, "", cluster, blob), false)
                .unwrap();
        }
        zim.close().unwrap();
    }

    // reopen without the zstd codec
    let mut registry = CompressionRegistry::builtin();
    registry.unregister(5);
    registry.unregister(6);
    let zim = Zim::open_with(&path, OpenMode::Read, 0, Policy::default(), registry).unwrap();

    assert_eq!(
        zim.get_content_entry_by_url("a").unwrap().read().unwrap(),
        b"content 0"
    );
    assert_eq!(
        zim.get_content_entry_by_url("b").unwrap().read().unwrap(),
        b"content 1"
    );
    let c = zim.get_content_entry_by_url("c").unwrap();
    assert!(matches!(c.read(), Err(ZimError::UnsupportedCompression(5))));
}

#[test]
fn s4_create_add_flush_reopen_verifies() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    {
        let zim = Zim::create(&path).unwrap();
        zim.add_item(item(b'C', "a", "", b"x")).unwrap();
        zim.flush().unwrap();
        zim.close().unwrap();
    }

    let policy = Policy {
        verify_checksum_on_open: true,
        ..Policy::default()
    };
    let zim =
        Zim::open_with(&path, OpenMode::Read, 0, policy, CompressionRegistry::builtin()).unwrap();
    assert_eq!(zim.entry_count(), 1);
    let entry = zim.get_content_entry_by_url("a").unwrap();
    assert_eq!(entry.read().unwrap(), b"x");
    assert_eq!(
        zim.stored_checksum().unwrap(),
        zim.compute_checksum().unwrap()
    );
}

#[test]
fn s5_allocator_first_fit_with_hole() {
    use zim_core::{AllocStrategy, FreeRange, SpaceAllocator};

    let mut alloc = SpaceAllocator::from_holes(
        [FreeRange {
            start: 2048,
            length: 64,
        }],
        4096,
        AllocStrategy::FirstFit,
        true,
    );
    assert_eq!(alloc.allocate(32), 2048);
    assert_eq!(
        alloc.snapshot(),
        vec![FreeRange {
            start: 2080,
            length: 32
        }]
    );
}

#[test]
fn s6_add_remove_flush_is_byte_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    let policy = Policy {
        truncate_after_write: true,
        ..Policy::default()
    };

    {
        let zim =
            Zim::create_with(&path, policy.clone(), CompressionRegistry::builtin()).unwrap();
        zim.set_uuid(Uuid::from_u128(7)).unwrap();
        zim.add_item(item(b'C', "seed", "Seed", b"seed content")).unwrap();
        zim.close().unwrap();
    }
    let baseline = std::fs::read(&path).unwrap();

    {
        let zim = Zim::open_with(
            &path,
            OpenMode::Update,
            0,
            policy,
            CompressionRegistry::builtin(),
        )
        .unwrap();
        let mut builder = zim_core::ClusterBuilder::new(CompressionType::None);
        let blob = builder.push_blob(b"temporary".to_vec());
        let cluster = zim.add_cluster(&builder).unwrap();
        zim.add_entry(Entry::content(0, b'C', "zzz", "", cluster, blob), false)
            .unwrap();
        zim.remove_entry(b'C', "zzz").unwrap();
        zim.close().unwrap();
    }
    let after = std::fs::read(&path).unwrap();
    assert_eq!(baseline, after);
}

#[test]
fn lookup_totality_and_sorted_lists() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    {
        let zim = Zim::create(&path).unwrap();
        for url in ["zebra", "apple", "Mango", "a/b/c", "1-digit"] {
            zim.add_item(item(b'C', url, &format!("Title {url}"), url.as_bytes()))
                .unwrap();
        }
        zim.add_item(item(b'M', "Title", "", b"archive title")).unwrap();
        zim.close().unwrap();
    }

    let zim = Zim::open(&path, OpenMode::Read).unwrap();
    let count = zim.entry_count();
    assert_eq!(count, 6);

    // every index resolves, and its URL finds the same index back
    for i in 0..count {
        let entry = zim.get_entry_by_id(i).unwrap();
        let found = zim
            .url_index_of(entry.namespace(), entry.url())
            .unwrap()
            .expect("entry URL must be findable");
        assert_eq!(found, i);
    }

    // URL order is strictly ascending in (namespace, url)
    let mut last: Option<(u8, String)> = None;
    for entry in zim.iter_entries(None).unwrap() {
        let entry = entry.unwrap();
        let key = (entry.namespace(), entry.url().to_string());
        if let Some(prev) = &last {
            assert!(*prev < key, "{prev:?} !< {key:?}");
        }
        last = Some(key);
    }

    // title lookups agree with URL lookups
    let by_title = zim.get_entry_by_title(b'C', "Title zebra").unwrap();
    assert_eq!(by_title.url(), "zebra");
}

#[test]
fn redirect_loop_and_depth_limits() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    {
        let zim = Zim::create(&path).unwrap();
        zim.add_item(item(b'C', "target", "", b"t")).unwrap();
        zim.add_redirect(b'C', "r1", "", b'C', "target").unwrap();
        zim.add_redirect(b'C', "r2", "", b'C', "r1").unwrap();
        // rewrite r1 to point at r2, closing the cycle
        let r2_index = zim.url_index_of(b'C', "r2").unwrap().unwrap();
        zim.edit_entry(b'C', "r1", |e| {
            *e = Entry::redirect(b'C', "r1", "", r2_index);
        })
        .unwrap();
        zim.close().unwrap();
    }

    let zim = Zim::open(&path, OpenMode::Read).unwrap();
    let r1 = zim.get_entry_by_url(b'C', "r1").unwrap();
    assert!(matches!(zim.resolve(&r1), Err(ZimError::RedirectLoop)));

    // a long but acyclic chain trips the depth bound instead
    let dir2 = TempDir::new().unwrap();
    let path2 = archive_path(&dir2);
    {
        let zim = Zim::create(&path2).unwrap();
        zim.add_item(item(b'C', "end", "", b"e")).unwrap();
        let mut target = "end".to_string();
        for i in 0..6 {
            let url = format!("hop{i}");
            zim.add_redirect(b'C', &url, "", b'C', &target).unwrap();
            target = url;
        }
        zim.close().unwrap();
    }
    let policy = Policy {
        redirect_max_depth: 4,
        ..Policy::default()
    };
    let zim = Zim::open_with(
        &path2,
        OpenMode::Read,
        0,
        policy,
        CompressionRegistry::builtin(),
    )
    .unwrap();
    let top = zim.get_entry_by_url(b'C', "hop5").unwrap();
    assert!(matches!(
        zim.resolve(&top),
        Err(ZimError::RedirectTooDeep(4))
    ));
}

#[test]
fn round_trip_without_edits_leaves_bytes_untouched() {
    let dir = TempDir::new().unwrap();
    let path = build_three_entry_archive(&dir);
    let before = std::fs::read(&path).unwrap();

    let policy = Policy {
        truncate_after_write: true,
        ..Policy::default()
    };
    let zim = Zim::open_with(
        &path,
        OpenMode::Update,
        0,
        policy,
        CompressionRegistry::builtin(),
    )
    .unwrap();
    zim.flush().unwrap();
    zim.close().unwrap();

    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn metadata_interface() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    {
        let zim = Zim::create(&path).unwrap();
        zim.set_metadata("Title", "My Wiki", "text/plain").unwrap();
        zim.set_metadata("Language", "eng", "text/plain").unwrap();
        zim.add_item(item(b'C', "page", "", b"body")).unwrap();
        zim.close().unwrap();
    }

    let zim = Zim::open(&path, OpenMode::Read).unwrap();
    assert_eq!(zim.metadata("Title").unwrap(), b"My Wiki");
    assert_eq!(zim.metadata("Language").unwrap(), b"eng");
    assert!(matches!(zim.metadata("Missing"), Err(ZimError::NotFound(_))));
    assert_eq!(zim.metadata_keys().unwrap(), vec!["Language", "Title"]);
}

#[test]
fn main_page_via_header_slot() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    {
        let zim = Zim::create(&path).unwrap();
        zim.add_item(item(b'C', "main", "Main", b"main page")).unwrap();
        let index = zim.url_index_of(b'C', "main").unwrap().unwrap();
        zim.set_main_page(Some(index)).unwrap();
        zim.close().unwrap();
    }

    let zim = Zim::open(&path, OpenMode::Read).unwrap();
    let main = zim.main_page_entry().unwrap();
    assert_eq!(main.url(), "main");
    // the layout slot stays absent
    assert!(matches!(
        zim.layout_page_entry(),
        Err(ZimError::NotFound(_))
    ));
}

#[test]
fn iteration_is_lazy_and_filterable() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    {
        let zim = Zim::create(&path).unwrap();
        zim.add_item(item(b'A', "meta-index", "", b"i")).unwrap();
        zim.add_item(item(b'C', "one", "", b"1")).unwrap();
        zim.add_item(item(b'C', "two", "", b"2")).unwrap();
        zim.add_item(item(b'M', "Name", "", b"n")).unwrap();
        zim.close().unwrap();
    }

    let zim = Zim::open(&path, OpenMode::Read).unwrap();
    let all: Vec<_> = zim
        .iter_entries(None)
        .unwrap()
        .map(|e| e.unwrap().full_url())
        .collect();
    assert_eq!(all, vec!["Ameta-index", "Cone", "Ctwo", "MName"]);

    let content: Vec<_> = zim
        .iter_entries(Some(b'C'))
        .unwrap()
        .map(|e| e.unwrap().url().to_string())
        .collect();
    assert_eq!(content, vec!["one", "two"]);

    // cluster and blob iteration
    let clusters = zim.iter_clusters().unwrap().count();
    assert_eq!(clusters as u32, zim.cluster_count());
    let entry = zim.get_content_entry_by_url("one").unwrap();
    let blobs: Vec<_> = zim
        .iter_blobs(entry.cluster_number().unwrap())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    assert_eq!(blobs, vec![b"1".to_vec()]);
}

#[test]
fn archive_embedded_at_an_offset() {
    let dir = TempDir::new().unwrap();
    let path = build_three_entry_archive(&dir);
    let archive_bytes = std::fs::read(&path).unwrap();

    // embed after 512 bytes of foreign data
    let embedded_path = dir.path().join("embedded.bin");
    let mut combined = vec![0xA5u8; 512];
    combined.extend_from_slice(&archive_bytes);
    std::fs::write(&embedded_path, combined).unwrap();

    let zim = Zim::open_at(&embedded_path, OpenMode::Read, 512).unwrap();
    assert_eq!(zim.entry_count(), 3);
    let entry = zim.get_content_entry_by_url("hello").unwrap();
    assert_eq!(entry.read().unwrap(), b"Hello\n");
    assert_eq!(
        zim.stored_checksum().unwrap(),
        zim.compute_checksum().unwrap()
    );
}

#[test]
fn corrupted_magic_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = build_three_entry_archive(&dir);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    assert!(matches!(
        Zim::open(&path, OpenMode::Read),
        Err(ZimError::UnsupportedFormat(_))
    ));
}

#[test]
fn corrupted_body_fails_checksum_verification() {
    let dir = TempDir::new().unwrap();
    let path = build_three_entry_archive(&dir);
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let policy = Policy {
        verify_checksum_on_open: true,
        ..Policy::default()
    };
    let result = Zim::open_with(
        &path,
        OpenMode::Read,
        0,
        policy,
        CompressionRegistry::builtin(),
    );
    assert!(matches!(
        result,
        Err(ZimError::ChecksumMismatch) | Err(ZimError::Format(_))
    ));
}

#[test]
fn unbound_entry_operations_require_binding() {
    let entry = Entry::content(0, b'C', "a", "", 0, 0);
    assert!(matches!(entry.read(), Err(ZimError::BindRequired)));
    assert!(matches!(entry.resolve(), Err(ZimError::BindRequired)));
    assert!(matches!(entry.mimetype(), Err(ZimError::BindRequired)));

    // redirects know their mimetype without an archive
    let redirect = Entry::redirect(b'C', "r", "", 0);
    assert_eq!(redirect.mimetype().unwrap(), "<redirect>");
}

#[test]
fn closed_archive_rejects_operations() {
    let dir = TempDir::new().unwrap();
    let path = build_three_entry_archive(&dir);
    let zim = Zim::open(&path, OpenMode::Read).unwrap();
    let entry = zim.get_content_entry_by_url("hello").unwrap();
    zim.close().unwrap();

    assert!(matches!(
        zim.get_content_entry_by_url("hello"),
        Err(ZimError::ArchiveClosed)
    ));
    // bound entries observe the closed handle too
    assert!(matches!(entry.read(), Err(ZimError::ArchiveClosed)));
}

#[test]
fn read_only_archive_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let path = build_three_entry_archive(&dir);
    let zim = Zim::open(&path, OpenMode::Read).unwrap();
    assert!(matches!(
        zim.add_item(item(b'C', "new", "", b"n")),
        Err(ZimError::ReadOnly)
    ));
    assert!(matches!(
        zim.remove_entry(b'C', "hello"),
        Err(ZimError::ReadOnly)
    ));
    assert!(matches!(zim.flush(), Err(ZimError::ReadOnly)));
}

#[test]
fn streaming_policy_reads_the_same_bytes() {
    let dir = TempDir::new().unwrap();
    let path = build_three_entry_archive(&dir);

    let policy = Policy::low_memory();
    let zim = Zim::open_with(
        &path,
        OpenMode::Read,
        0,
        policy,
        CompressionRegistry::builtin(),
    )
    .unwrap();
    assert_eq!(
        zim.get_content_entry_by_url("hello").unwrap().read().unwrap(),
        b"Hello\n"
    );
    assert_eq!(
        zim.get_content_entry_by_url("world").unwrap().read().unwrap(),
        b"World\n"
    );
}
