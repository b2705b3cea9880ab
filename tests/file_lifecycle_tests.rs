#![allow(clippy::unwrap_used, clippy::similar_names, missing_docs)]

mod common;

use bytes::Bytes;
use containerfs::fs::ItemType;
use containerfs::store::OpenMode;
use containerfs::{FsError, OpenFlags};

use common::{Fixture, names, read_all, write_new};

#[tokio::test]
async fn create_write_close_read_round_trip() {
    let fx = Fixture::new();
    let fs = fx.fs().await;

    let d = fs.create_file("/_documents/log.txt").await.unwrap();
    for chunk in [&b"alpha "[..], b"beta ", b"gamma"] {
        let cursor = fs
            .item_attributes("/_documents/log.txt", Some(d))
            .await
            .unwrap()
            .size;
        fs.write_file_buf("/_documents/log.txt", d, cursor, chunk)
            .await
            .unwrap();
    }
    fs.close_file("/_documents/log.txt", d).await.unwrap();

    let data = read_all(&fs, "/_documents/log.txt").await;
    assert_eq!(&data[..], b"alpha beta gamma");
    let attrs = fs.item_attributes("/_documents/log.txt", None).await.unwrap();
    assert_eq!(attrs.item_type, ItemType::File);
    assert_eq!(attrs.size, 16);
    assert_eq!(attrs.version, 0);
}

#[tokio::test]
async fn read_buf_is_clamped_to_file_size() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_public/a.txt", b"hello").await;

    let d = fs.open_file("/_public/a.txt", OpenMode::Read).await.unwrap();
    let mut buf = [0u8; 16];
    let n = fs
        .read_file_buf("/_public/a.txt", d, 2, &mut buf)
        .await
        .unwrap();
    assert_eq!(&buf[..n], b"llo");
    assert!(fs.read_file("/_public/a.txt", d, 9, 4).await.unwrap().is_empty());
    fs.close_file("/_public/a.txt", d).await.unwrap();
}

#[tokio::test]
async fn opening_missing_file_is_not_found() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    assert!(matches!(
        fs.open_file("/_documents/nope.txt", OpenMode::Read).await,
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        fs.open("/_documents/nope.txt", OpenFlags::WRONLY).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn creating_existing_file_already_exists() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_documents/a.txt", b"x").await;

    let err = fs.create_file("/_documents/a.txt").await.unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists(_)));
    assert_eq!(err.errno(), libc::EEXIST);
    assert!(matches!(
        fs.open(
            "/_documents/a.txt",
            OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::EXCL
        )
        .await,
        Err(FsError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn creating_a_file_twice_before_commit_already_exists() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let d = fs.create_file("/_documents/a.txt").await.unwrap();
    assert!(matches!(
        fs.create_file("/_documents/a.txt").await,
        Err(FsError::AlreadyExists(_))
    ));
    fs.close_file("/_documents/a.txt", d).await.unwrap();
}

#[tokio::test]
async fn descriptor_is_invalid_after_close() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let d = fs.create_file("/_documents/a.txt").await.unwrap();
    fs.close_file("/_documents/a.txt", d).await.unwrap();

    assert_eq!(
        fs.read_file("/_documents/a.txt", d, 0, 1).await,
        Err(FsError::InvalidDescriptor)
    );
    assert_eq!(
        fs.close_file("/_documents/a.txt", d).await,
        Err(FsError::InvalidDescriptor)
    );
    assert_eq!(fs.stats().open_descriptors, 0);
}

#[tokio::test]
async fn descriptor_is_bound_to_its_path() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_documents/a.txt", b"a").await;
    write_new(&fs, "/_documents/b.txt", b"b").await;

    let d = fs.open_file("/_documents/a.txt", OpenMode::Read).await.unwrap();
    assert_eq!(
        fs.read_file("/_documents/b.txt", d, 0, 1).await,
        Err(FsError::InvalidDescriptor)
    );
    fs.close_file("/_documents/a.txt", d).await.unwrap();
}

#[tokio::test]
async fn empty_file_reads_empty() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_documents/empty", b"").await;

    assert_eq!(fx.store.open_handle_count(), 0);
    let data = read_all(&fs, "/_documents/empty").await;
    assert!(data.is_empty());
    assert_eq!(
        fs.item_attributes("/_documents/empty", None)
            .await
            .unwrap()
            .size,
        0
    );
}

#[tokio::test]
async fn forward_gap_is_zero_filled_and_backward_write_fails() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let path = "/_documents/sparse.bin";
    let d = fs.create_file(path).await.unwrap();
    fs.write_file_buf(path, d, 0, b"ab").await.unwrap();
    fs.write_file_buf(path, d, 4, b"cd").await.unwrap();
    fs.close_file(path, d).await.unwrap();
    assert_eq!(&read_all(&fs, path).await[..], b"ab\0\0cd");

    let d = fs.open_file(path, OpenMode::Append).await.unwrap();
    let err = fs.write_file_buf(path, d, 1, b"z").await.unwrap_err();
    assert_eq!(err, FsError::BackwardWrite { cursor: 6, offset: 1 });
    assert_eq!(err.errno(), libc::ESPIPE);

    assert_eq!(
        fs.write_file_buf(path, d, 6, b"z").await,
        Err(FsError::InvalidDescriptor)
    );
    assert_eq!(fs.close_file(path, d).await, Err(FsError::InvalidDescriptor));
    assert_eq!(fx.store.open_handle_count(), 0);
    assert_eq!(&read_all(&fs, path).await[..], b"ab\0\0cd");
}

#[tokio::test]
async fn a_b_txt_write_truncate_rename() {
    let fx = Fixture::new();
    let fs = fx.fs().await;

    write_new(&fs, "/a/b.txt", b"hello").await;
    assert_eq!(&read_all(&fs, "/a/b.txt").await[..], b"hello");
    assert_eq!(fs.item_attributes("/a/b.txt", None).await.unwrap().size, 5);

    let d = fs.open_file("/a/b.txt", OpenMode::Overwrite).await.unwrap();
    fs.truncate_file("/a/b.txt", d, 0).await.unwrap();
    fs.close_file("/a/b.txt", d).await.unwrap();
    assert!(read_all(&fs, "/a/b.txt").await.is_empty());
    assert_eq!(fs.item_attributes("/a/b.txt", None).await.unwrap().size, 0);

    assert_eq!(names(&fs, "/a").await, ["b.txt"]);
    fs.rename_file("/a/b.txt", "/a/c.txt").await.unwrap();
    assert_eq!(names(&fs, "/a").await, ["c.txt"]);
    assert!(read_all(&fs, "/a/c.txt").await.is_empty());
    assert!(matches!(
        fs.item_attributes("/a/b.txt", None).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn rename_keeps_content() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_documents/old.txt", b"content").await;
    fs.rename_file("/_documents/old.txt", "/_documents/new.txt")
        .await
        .unwrap();
    assert_eq!(&read_all(&fs, "/_documents/new.txt").await[..], b"content");
}

#[tokio::test]
async fn truncate_to_non_zero_is_unimplemented() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_documents/a.txt", b"abc").await;
    let d = fs
        .open_file("/_documents/a.txt", OpenMode::Overwrite)
        .await
        .unwrap();
    assert!(matches!(
        fs.truncate_file("/_documents/a.txt", d, 1).await,
        Err(FsError::Unimplemented(_))
    ));

    assert_eq!(
        fs.write_file_buf("/_documents/a.txt", d, 0, b"x").await,
        Err(FsError::InvalidDescriptor)
    );
    assert_eq!(
        fs.close_file("/_documents/a.txt", d).await,
        Err(FsError::InvalidDescriptor)
    );
    assert_eq!(fs.stats().open_descriptors, 0);
    assert_eq!(fx.store.open_handle_count(), 0);
    assert_eq!(&read_all(&fs, "/_documents/a.txt").await[..], b"abc");
}

#[tokio::test]
async fn two_appends_on_an_uncommitted_file() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let path = "/_documents/journal.txt";

    let first = fs.create_file(path).await.unwrap();
    fs.write_file_buf(path, first, 0, b"hello").await.unwrap();

    // The create is still open; the second open forces it to commit first.
    let second = fs.open_file(path, OpenMode::Append).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(fs.item_attributes(path, Some(second)).await.unwrap().size, 5);
    fs.write_file_buf(path, second, 5, b" world").await.unwrap();
    fs.close_file(path, second).await.unwrap();
    assert_eq!(&read_all(&fs, path).await[..], b"hello world");

    // The first descriptor survived the recovery and still closes cleanly.
    fs.close_file(path, first).await.unwrap();
    assert_eq!(&read_all(&fs, path).await[..], b"hello world");

    let third = fs.open_file(path, OpenMode::Append).await.unwrap();
    fs.write_file_buf(path, third, 11, b"!").await.unwrap();
    fs.close_file(path, third).await.unwrap();
    assert_eq!(&read_all(&fs, path).await[..], b"hello world!");
    assert_eq!(fs.item_attributes(path, None).await.unwrap().version, 2);
}

#[tokio::test]
async fn racing_appends_both_land_after_recovery() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let path = "/_documents/j.txt";

    let first = fs.open_file(path, OpenMode::Append).await.unwrap();
    fs.write_file_buf(path, first, 0, b"A").await.unwrap();
    let second = fs.open_file(path, OpenMode::Append).await.unwrap();

    fs.write_file_buf(path, first, 1, b"B").await.unwrap();
    fs.close_file(path, first).await.unwrap();
    assert_eq!(&read_all(&fs, path).await[..], b"AB");

    let cursor = fs.item_attributes(path, Some(second)).await.unwrap().size;
    assert_eq!(cursor, 2);
    fs.write_file_buf(path, second, cursor, b"C").await.unwrap();
    fs.close_file(path, second).await.unwrap();

    assert_eq!(&read_all(&fs, path).await[..], b"ABC");
    assert_eq!(fs.item_attributes(path, None).await.unwrap().version, 2);
    assert_eq!(fs.stats().open_descriptors, 0);
    assert_eq!(fx.store.open_handle_count(), 0);
}

#[tokio::test]
async fn failure_on_a_shared_append_releases_both_descriptors() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let path = "/_documents/j.txt";

    let first = fs.create_file(path).await.unwrap();
    fs.write_file_buf(path, first, 0, b"A").await.unwrap();
    let second = fs.open_file(path, OpenMode::Append).await.unwrap();

    assert!(matches!(
        fs.write_file_buf(path, second, 0, b"x").await,
        Err(FsError::BackwardWrite { .. })
    ));
    assert_eq!(
        fs.write_file_buf(path, first, 1, b"B").await,
        Err(FsError::InvalidDescriptor)
    );
    assert_eq!(fs.stats().open_descriptors, 0);
    assert_eq!(&read_all(&fs, path).await[..], b"A");
}

#[tokio::test]
async fn copy_across_containers_shares_the_blob() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_documents/photo.jpg", b"jpegdata").await;
    fs.copy_file("/_documents/photo.jpg", "/_public/photo.jpg")
        .await
        .unwrap();

    assert_eq!(&read_all(&fs, "/_public/photo.jpg").await[..], b"jpegdata");
    let src = fx.store.entry(fx.documents, "photo.jpg").unwrap();
    let dst = fx.store.entry(fx.public, "photo.jpg").unwrap();
    let (
        containerfs::store::EntryValue::File(src),
        containerfs::store::EntryValue::File(dst),
    ) = (src.value, dst.value)
    else {
        panic!("expected files");
    };
    assert_eq!(src.blob, dst.blob);
}

#[tokio::test]
async fn rename_across_containers_moves_the_file() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_documents/a.txt", b"moved").await;
    fs.rename_file("/_documents/a.txt", "/_public/a.txt")
        .await
        .unwrap();
    assert_eq!(&read_all(&fs, "/_public/a.txt").await[..], b"moved");
    assert!(names(&fs, "/_documents").await.is_empty());
}

#[tokio::test]
async fn metadata_is_committed_on_close() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let path = "/_documents/tagged.txt";
    write_new(&fs, path, b"body").await;

    let d = fs.open_file(path, OpenMode::Read).await.unwrap();
    assert!(fs.get_file_metadata(path, d).await.unwrap().is_empty());
    fs.set_file_metadata(path, d, Bytes::from_static(b"color=red"))
        .await
        .unwrap();
    assert_eq!(
        fs.get_file_metadata(path, d).await.unwrap(),
        Bytes::from_static(b"color=red")
    );
    fs.close_file(path, d).await.unwrap();

    let d = fs.open_file(path, OpenMode::Read).await.unwrap();
    assert_eq!(
        fs.get_file_metadata(path, d).await.unwrap(),
        Bytes::from_static(b"color=red")
    );
    fs.close_file(path, d).await.unwrap();
    assert_eq!(&read_all(&fs, path).await[..], b"body");
    assert_eq!(fs.item_attributes(path, None).await.unwrap().version, 1);
}

#[tokio::test]
async fn container_paths_are_not_files() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    assert!(matches!(
        fs.open_file("/_documents", OpenMode::Read).await,
        Err(FsError::IsAContainer(_))
    ));
    assert!(matches!(
        fs.open("/_documents", OpenFlags::WRONLY).await,
        Err(FsError::IsAContainer(_))
    ));
    assert_eq!(
        fs.item_type("/_documents").await.unwrap(),
        ItemType::Container
    );
}

#[tokio::test]
async fn pending_create_reports_new_file() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let d = fs.create_file("/_documents/draft.txt").await.unwrap();
    assert_eq!(
        fs.item_type("/_documents/draft.txt").await.unwrap(),
        ItemType::NewFile
    );
    fs.close_file("/_documents/draft.txt", d).await.unwrap();
    assert_eq!(
        fs.item_type("/_documents/draft.txt").await.unwrap(),
        ItemType::File
    );
}
