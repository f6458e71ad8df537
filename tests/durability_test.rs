//! File-backed durability: create, reopen, verify.

use std::path::Path;

use mvcore::common::{DbConfig, Value, ValueType};
use mvcore::expr::{Expression, Operator};
use mvcore::table::{ColumnDefinition, Constraint, TableDefinition};
use mvcore::txn::Conglomerate;
use tempfile::tempdir;

fn file_config(dir: &Path) -> DbConfig {
    DbConfig {
        database_path: dir.to_path_buf(),
        page_size: 1024,
        max_cache_pages: 32,
        // Small thresholds exercise the blob path.
        string_blob_threshold: 64,
        ..DbConfig::default()
    }
}

fn doc_def() -> TableDefinition {
    TableDefinition::new(
        "doc",
        vec![
            ColumnDefinition::new("id", ValueType::Integer).not_null().sorted_index(),
            ColumnDefinition::new("body", ValueType::Text),
        ],
    )
    .unwrap()
    .with_constraint(Constraint::PrimaryKey {
        name: "pk_doc".into(),
        columns: vec!["id".into()],
    })
    .unwrap()
}

#[test]
fn test_create_reopen_read() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let big_body = "lorem ".repeat(100);

    {
        let cong = Conglomerate::create(config.clone()).unwrap();
        cong.create_table(doc_def()).unwrap();
        let mut t = cong.begin();
        for id in 0..20 {
            let body = if id == 7 {
                big_body.clone()
            } else {
                format!("short {}", id)
            };
            t.insert("doc", &[Value::Integer(id), Value::Text(body)])
                .unwrap();
        }
        t.commit().unwrap();
    }

    // Reopen: the version check runs, the opening scan cross-checks
    // every row, and the data reads back.
    let cong = Conglomerate::open(config).unwrap();
    let mut t = cong.begin();
    assert_eq!(t.row_count("doc").unwrap(), 20);
    let predicate = Expression::binary(
        Expression::var("id"),
        Operator::Eq,
        Expression::literal(Value::Integer(7)),
    );
    let rows = t.select("doc", Some(&predicate)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        t.get_cell("doc", 1, rows[0]).unwrap(),
        Value::Text(big_body)
    );
    t.rollback();
}

#[test]
fn test_reopen_after_deletes_preserves_live_rows() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());

    {
        let cong = Conglomerate::create(config.clone()).unwrap();
        cong.create_table(doc_def()).unwrap();
        let mut t = cong.begin();
        for id in 0..10 {
            t.insert("doc", &[Value::Integer(id), Value::Text(format!("d{}", id))])
                .unwrap();
        }
        t.commit().unwrap();

        let mut t = cong.begin();
        let odd = Expression::binary(
            Expression::binary(
                Expression::var("id"),
                Operator::Div,
                Expression::literal(Value::Integer(2)),
            ),
            Operator::Ne,
            Expression::literal(Value::Integer(0)),
        );
        // Delete ids >= 2 (integer division by 2 is nonzero).
        t.delete_where("doc", &odd).unwrap();
        t.commit().unwrap();
    }

    let cong = Conglomerate::open(config).unwrap();
    let mut t = cong.begin();
    assert_eq!(t.row_count("doc").unwrap(), 2);
    t.rollback();
}

#[test]
fn test_read_only_blocks_writes() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    {
        let cong = Conglomerate::create(config.clone()).unwrap();
        cong.create_table(doc_def()).unwrap();
    }

    let read_only = DbConfig {
        read_only: true,
        ..config
    };
    let cong = Conglomerate::open(read_only).unwrap();
    let mut t = cong.begin();
    let err = t
        .insert("doc", &[Value::Integer(1), Value::Text("x".into())])
        .unwrap_err();
    assert_eq!(err.code(), "READ_ONLY");
    t.rollback();

    assert!(cong.create_table(doc_def()).is_err());
}

#[test]
fn test_open_missing_database_fails() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    assert!(Conglomerate::open(config).is_err());
}

#[test]
fn test_compact_table_preserves_data() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let cong = Conglomerate::create(config).unwrap();
    cong.create_table(doc_def()).unwrap();

    let mut t = cong.begin();
    for id in 0..50 {
        t.insert("doc", &[Value::Integer(id), Value::Text(format!("d{}", id))])
            .unwrap();
    }
    t.commit().unwrap();

    assert_eq!(cong.compact_table("doc").unwrap(), 50);

    let mut t = cong.begin();
    assert_eq!(t.row_count("doc").unwrap(), 50);
    let rows = t.select("doc", None).unwrap();
    assert_eq!(
        t.get_cell("doc", 1, rows[0]).unwrap(),
        Value::Text("d0".into())
    );
    t.rollback();
}

#[test]
fn test_many_transactions_on_disk() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let cong = Conglomerate::create(config).unwrap();
    cong.create_table(doc_def()).unwrap();

    for id in 0..30 {
        let mut t = cong.begin();
        t.insert("doc", &[Value::Integer(id), Value::Text("v".into())])
            .unwrap();
        t.commit().unwrap();
    }
    let mut t = cong.begin();
    assert_eq!(t.row_count("doc").unwrap(), 30);
    t.rollback();
}
