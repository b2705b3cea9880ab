#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use containerfs::FsError;
use containerfs::store::memory::StoreCall;
use containerfs::store::{OpenMode, StoreError};

use common::{Fixture, read_all, write_new};

#[tokio::test]
async fn backend_write_failure_invalidates_the_descriptor() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let path = "/_documents/a.txt";
    write_new(&fs, path, b"original").await;

    let d = fs.open_file(path, OpenMode::Overwrite).await.unwrap();
    fx.store
        .fail_next(StoreCall::Write, StoreError::Backend("disk on fire".to_owned()));
    let err = fs.write_file_buf(path, d, 0, b"new").await.unwrap_err();
    assert!(matches!(err, FsError::Backend(_)));
    assert_eq!(err.errno(), libc::EIO);

    assert_eq!(
        fs.write_file_buf(path, d, 0, b"new").await,
        Err(FsError::InvalidDescriptor)
    );
    assert_eq!(fs.close_file(path, d).await, Err(FsError::InvalidDescriptor));
    assert_eq!(fx.store.open_handle_count(), 0);
    assert_eq!(fs.stats().open_descriptors, 0);
    assert_eq!(&read_all(&fs, path).await[..], b"original");
}

#[tokio::test]
async fn failed_open_hands_out_no_descriptor() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_documents/a.txt", b"abc").await;

    fx.store
        .fail_next(StoreCall::Open, StoreError::Backend("unreachable".to_owned()));
    assert!(matches!(
        fs.open_file("/_documents/a.txt", OpenMode::Read).await,
        Err(FsError::Backend(_))
    ));
    assert_eq!(fs.stats().open_descriptors, 0);
    assert_eq!(&read_all(&fs, "/_documents/a.txt").await[..], b"abc");
}

#[tokio::test]
async fn quota_exhaustion_raises_the_session_flag() {
    let fx = Fixture::with_quota(4);
    let fs = fx.fs().await;
    let path = "/_documents/big.bin";

    let d = fs.create_file(path).await.unwrap();
    let err = fs.write_file_buf(path, d, 0, b"too large").await.unwrap_err();
    assert_eq!(err, FsError::QuotaExceeded);
    assert_eq!(err.errno(), libc::EDQUOT);

    assert!(fs.session().low_balance());
    assert!(fs.stats().low_balance);
    assert_eq!(
        fs.read_file(path, d, 0, 1).await,
        Err(FsError::InvalidDescriptor)
    );
    // The abandoned create no longer shows up.
    assert!(matches!(
        fs.item_type(path).await,
        Err(FsError::NotFound(_))
    ));
    assert_eq!(fx.store.open_handle_count(), 0);
}

#[tokio::test]
async fn losing_a_commit_race_is_a_version_conflict() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    let path = "/_documents/shared.txt";
    write_new(&fs, path, b"base").await;

    let d = fs.open_file(path, OpenMode::Overwrite).await.unwrap();
    fs.write_file_buf(path, d, 0, b"mine").await.unwrap();
    fx.store.put_file(fx.documents, "shared.txt", b"theirs").unwrap();

    let err = fs.close_file(path, d).await.unwrap_err();
    assert!(matches!(err, FsError::VersionConflict { .. }));
    assert_eq!(err.errno(), libc::ESTALE);
    assert_eq!(fs.close_file(path, d).await, Err(FsError::InvalidDescriptor));

    // Nothing was rebased or retried.
    assert_eq!(&read_all(&fs, path).await[..], b"theirs");
}

#[tokio::test]
async fn failed_index_load_is_retried() {
    let fx = Fixture::new();
    let fs = fx.fs().await;
    write_new(&fs, "/_documents/a.txt", b"a").await;
    fs.refresh("/_documents").await.unwrap();

    fx.store
        .fail_next(StoreCall::Entries, StoreError::Backend("timeout".to_owned()));
    assert!(matches!(
        fs.list_folder("/_documents").await,
        Err(FsError::Backend(_))
    ));
    assert_eq!(fs.list_folder("/_documents").await.unwrap().len(), 1);
}
