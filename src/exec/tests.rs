use super::*;
use crate::catalog::ColumnType;
use serde_json::json;
use tempfile::TempDir;

fn setup_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(temp_dir.path().join("db")).unwrap();
    engine
        .create_table(
            "t",
            &[
                ("id", ColumnType::Int, true),
                ("name", ColumnType::Varchar, false),
                ("age", ColumnType::Int, false),
                ("dept", ColumnType::Varchar, false),
                ("salary", ColumnType::Int, false),
            ],
        )
        .unwrap();
    (temp_dir, engine)
}

fn insert_people(engine: &Engine, people: &[(&str, i64, &str, i64)]) -> Vec<u64> {
    let mut ids = Vec::new();
    // Small statements, the way the planner batches them.
    for chunk in people.chunks(5) {
        let rows: Vec<Vec<String>> = chunk
            .iter()
            .map(|(name, age, dept, salary)| {
                vec![
                    format!("'{}'", name),
                    age.to_string(),
                    dept.to_string(),
                    salary.to_string(),
                ]
            })
            .collect();
        let doc = json!({
            "operator": "INSERT",
            "table": "t",
            "selected_columns": ["name", "age", "dept", "salary"],
            "rows": rows,
        });
        match engine.execute(&doc).unwrap() {
            QueryOutput::Inserted(batch) => ids.extend(batch),
            other => panic!("unexpected output {:?}", other),
        }
    }
    ids
}

fn rows_of(output: QueryOutput) -> Vec<Row> {
    match output {
        QueryOutput::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    }
}

#[test]
fn test_insert_then_select_by_id() {
    let (_t, engine) = setup_engine();
    let ids = insert_people(&engine, &[("alice", 31, "eng", 100), ("bob", 44, "ops", 90)]);
    let alice_id = ids[0];

    let doc = json!({
        "operator": "PROJECT",
        "selected_columns": ["name"],
        "input": {
            "operator": "FILTER",
            "condition": {
                "op": {"kind": "EQUALS"},
                "operands": [{"name": "id"}, {"literal": alice_id}]
            },
            "input": {"operator": "SCAN", "table": "t"}
        }
    });
    let rows = rows_of(engine.execute(&doc).unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some("alice"));
    // The projection dropped everything else.
    assert_eq!(rows[0].values.len(), 1);
}

#[test]
fn test_delete_then_count() {
    let (_t, engine) = setup_engine();
    let mut people: Vec<(&str, i64, &str, i64)> = Vec::new();
    for i in 0..95i64 {
        people.push((
            if i % 2 == 0 { "carl" } else { "dora" },
            20 + (i % 50),
            "eng",
            100,
        ));
    }
    for _ in 0..5 {
        people.push(("alice", 30, "eng", 100));
    }
    insert_people(&engine, &people);

    let table = engine.disk.table("t").unwrap();
    let free_before = table.directory.total_free();

    // Total encoded length of the rows about to go away.
    let mut doomed_len = 0u64;
    for (page_id, _) in table.directory.pages_in_file_order() {
        let page = engine.fetch_page("t", page_id).unwrap();
        let entry = table.directory.get(page_id).unwrap();
        {
            let state = entry.read_state();
            let page = page.read().unwrap();
            for slot in state.slots.iter().filter(|s| !s.free) {
                let row = crate::storage::decode_row(page.slot_bytes(slot)).unwrap();
                if row.get("name") == Some("alice") {
                    doomed_len += slot.length as u64;
                }
            }
        }
        engine.pool.unpin(page_id, false).unwrap();
    }

    let doc = json!({
        "operator": "DELETE",
        "table": "t",
        "column": "name",
        "value": "'alice'"
    });
    let deleted = match engine.execute(&doc).unwrap() {
        QueryOutput::Deleted(ids) => ids,
        other => panic!("unexpected output {:?}", other),
    };
    assert_eq!(deleted.len(), 5);

    // COUNT(*) grouped by the shared dept column.
    let doc = json!({
        "operator": "AGGREGATE",
        "selected_columns": ["dept"],
        "aggregates": {"function": "COUNT", "args": []},
        "input": {"operator": "SCAN", "table": "t"}
    });
    let rows = rows_of(engine.execute(&doc).unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("eng"), Some("95"));

    // Freed bytes flowed back into the directory's accounting.
    assert_eq!(table.directory.total_free(), free_before + doomed_len);
}

#[test]
fn test_update_preserves_identity_end_to_end() {
    let (_t, engine) = setup_engine();
    let ids = insert_people(
        &engine,
        &[("bob", 44, "eng", 90), ("alice", 31, "eng", 100), ("bob", 45, "ops", 80)],
    );
    let mut bob_ids = vec![ids[0], ids[2]];
    bob_ids.sort_unstable();

    let doc = json!({
        "operator": "UPDATE",
        "table": "t",
        "set": {"column": "name", "value": "'carol'"},
        "filter": {"column": "name", "value": "'bob'"}
    });
    let mut updated = match engine.execute(&doc).unwrap() {
        QueryOutput::Updated(ids) => ids,
        other => panic!("unexpected output {:?}", other),
    };
    updated.sort_unstable();
    assert_eq!(updated, bob_ids);

    // No bobs remain.
    let doc = json!({
        "operator": "FILTER",
        "condition": {
            "op": {"kind": "EQUALS"},
            "operands": [{"name": "name"}, {"literal": "'bob'"}]
        },
        "input": {"operator": "SCAN", "table": "t"}
    });
    assert!(rows_of(engine.execute(&doc).unwrap()).is_empty());

    // The carols carry the old bob ids.
    let doc = json!({
        "operator": "FILTER",
        "condition": {
            "op": {"kind": "EQUALS"},
            "operands": [{"name": "name"}, {"literal": "'carol'"}]
        },
        "input": {"operator": "SCAN", "table": "t"}
    });
    let mut carol_ids: Vec<u64> = rows_of(engine.execute(&doc).unwrap())
        .iter()
        .map(|row| row.id)
        .collect();
    carol_ids.sort_unstable();
    assert_eq!(carol_ids, bob_ids);
}

#[test]
fn test_range_filter_with_sort() {
    let (_t, engine) = setup_engine();
    let people: Vec<(&str, i64, &str, i64)> = vec![
        ("a", 25, "eng", 1),
        ("b", 31, "eng", 1),
        ("c", 35, "eng", 1),
        ("d", 39, "eng", 1),
        ("e", 40, "eng", 1),
        ("f", 52, "eng", 1),
        ("g", 33, "eng", 1),
    ];
    insert_people(&engine, &people);

    let doc = json!({
        "operator": "PROJECT",
        "selected_columns": ["age"],
        "input": {
            "operator": "SORT",
            "column": "age",
            "sortDirection": "ASC",
            "input": {
                "operator": "FILTER",
                "refList": {"$1": "age"},
                "condition": {
                    "op": {"kind": "AND"},
                    "operands": [
                        {"op": {"kind": "GREATER_THAN"},
                         "operands": [{"name": "$1"}, {"literal": 31.0}]},
                        {"op": {"kind": "LESS_THAN"},
                         "operands": [{"name": "$1"}, {"literal": 39.0}]}
                    ]
                },
                "input": {"operator": "SCAN", "table": "t"}
            }
        }
    });
    let rows = rows_of(engine.execute(&doc).unwrap());
    let ages: Vec<&str> = rows.iter().map(|r| r.get("age").unwrap()).collect();
    // Range bounds are inclusive; sorted ascending.
    assert_eq!(ages, vec!["31", "33", "35", "39"]);
}

#[test]
fn test_sort_desc_with_limit() {
    let (_t, engine) = setup_engine();
    insert_people(
        &engine,
        &[("a", 10, "eng", 1), ("b", 30, "eng", 1), ("c", 20, "eng", 1)],
    );

    let doc = json!({
        "operator": "SORT",
        "column": "age",
        "sortDirection": "DESC",
        "limit": "2",
        "input": {"operator": "SCAN", "table": "t"}
    });
    let rows = rows_of(engine.execute(&doc).unwrap());
    let ages: Vec<&str> = rows.iter().map(|r| r.get("age").unwrap()).collect();
    assert_eq!(ages, vec!["30", "20"]);
}

#[test]
fn test_group_by_sum() {
    let (_t, engine) = setup_engine();
    insert_people(
        &engine,
        &[
            ("a", 30, "'eng'", 100),
            ("b", 31, "'eng'", 150),
            ("c", 32, "'ops'", 90),
            ("d", 33, "'ops'", 10),
            ("e", 34, "'sales'", 70),
        ],
    );

    let doc = json!({
        "operator": "AGGREGATE",
        "selected_columns": ["dept", "salary"],
        "aggregates": {"function": "SUM", "args": [1.0]},
        "input": {"operator": "SCAN", "table": "t"}
    });
    let rows = rows_of(engine.execute(&doc).unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("eng"), Some("250"));
    assert_eq!(rows[0].get("ops"), Some("100"));
    assert_eq!(rows[0].get("sales"), Some("70"));
}

#[test]
fn test_group_by_min_max_avg() {
    let (_t, engine) = setup_engine();
    insert_people(
        &engine,
        &[
            ("a", 30, "'eng'", 100),
            ("b", 40, "'eng'", 150),
            ("c", 20, "'eng'", 50),
        ],
    );

    for (function, expected) in [("MIN", "20"), ("MAX", "40"), ("AVG", "30")] {
        let doc = json!({
            "operator": "AGGREGATE",
            "selected_columns": ["dept", "age"],
            "aggregates": {"function": function, "args": [1.0]},
            "input": {"operator": "SCAN", "table": "t"}
        });
        let rows = rows_of(engine.execute(&doc).unwrap());
        assert_eq!(rows[0].get("eng"), Some(expected), "{}", function);
    }
}

#[test]
fn test_filter_decimal_compares_verbatim() {
    let (_t, engine) = setup_engine();
    engine
        .create_table(
            "prices",
            &[
                ("id", ColumnType::Int, true),
                ("amount", ColumnType::Decimal, false),
            ],
        )
        .unwrap();
    engine
        .insert(
            "prices",
            &["amount".to_string()],
            &[vec!["19.99".to_string()], vec!["20.00".to_string()]],
        )
        .unwrap();

    let doc = json!({
        "operator": "FILTER",
        "condition": {
            "op": {"kind": "EQUALS"},
            "operands": [{"name": "amount"}, {"literal": "'19.99'"}]
        },
        "input": {"operator": "SCAN", "table": "prices"}
    });
    let rows = rows_of(engine.execute(&doc).unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("amount"), Some("19.99"));
}

#[test]
fn test_select_unknown_table() {
    let (_t, engine) = setup_engine();
    let doc = json!({"operator": "SCAN", "table": "ghost"});
    assert!(matches!(
        engine.execute(&doc),
        Err(ExecError::Catalog(_))
    ));
}

#[test]
fn test_malformed_plan_rejected_up_front() {
    let (_t, engine) = setup_engine();
    let doc = json!({"operator": "FILTER", "input": {"operator": "SCAN", "table": "t"}});
    assert!(matches!(engine.execute(&doc), Err(ExecError::Plan(_))));
}

#[test]
fn test_cancelled_select_is_never_a_success() {
    let (_t, engine) = setup_engine();
    insert_people(&engine, &[("a", 1, "eng", 1), ("b", 2, "eng", 1)]);

    let cancel = CancelToken::new();
    cancel.cancel();

    let doc = json!({"operator": "SCAN", "table": "t"});
    let result = engine.execute_with_cancel(&doc, &cancel);
    assert!(matches!(result, Err(ExecError::Cancelled)));
}

#[test]
fn test_cancel_mid_query_terminates_pipeline() {
    let (_t, engine) = setup_engine();
    let people: Vec<(String, i64)> = (0..400).map(|i| (format!("u{}", i), i)).collect();
    let refs: Vec<(&str, i64, &str, i64)> = people
        .iter()
        .map(|(name, age)| (name.as_str(), *age, "eng", 1))
        .collect();
    insert_people(&engine, &refs);

    let cancel = CancelToken::new();
    let doc = json!({
        "operator": "FILTER",
        "condition": {
            "op": {"kind": "GREATER_THAN"},
            "operands": [{"name": "age"}, {"literal": -1}]
        },
        "input": {"operator": "SCAN", "table": "t"}
    });

    std::thread::scope(|scope| {
        let handle = {
            let cancel = cancel.clone();
            let doc = &doc;
            let engine = &engine;
            scope.spawn(move || engine.execute_with_cancel(doc, &cancel))
        };
        cancel.cancel();
        // select joins all stages before returning, so a clean return here
        // means no stage leaked.
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(ExecError::Cancelled)));
    });
}

#[test]
fn test_scan_preserves_physical_order() {
    let (_t, engine) = setup_engine();
    let people: Vec<(String, i64)> = (0..150).map(|i| (format!("u{}", i), i)).collect();
    let refs: Vec<(&str, i64, &str, i64)> = people
        .iter()
        .map(|(name, age)| (name.as_str(), *age, "eng", 1))
        .collect();
    insert_people(&engine, &refs);

    // Multiple pages by now.
    let table = engine.disk.table("t").unwrap();
    assert!(table.directory.len() > 1);

    let doc = json!({"operator": "SCAN", "table": "t"});
    let rows = rows_of(engine.execute(&doc).unwrap());
    assert_eq!(rows.len(), 150);
    let ages: Vec<i64> = rows
        .iter()
        .map(|r| r.get("age").unwrap().parse().unwrap())
        .collect();
    // Insertion order equals file order here: pages fill front to back.
    let mut sorted = ages.clone();
    sorted.sort_unstable();
    assert_eq!(ages, sorted);
}

#[test]
fn test_concurrent_readers_during_writes() {
    let (_t, engine) = setup_engine();
    let people: Vec<(String, i64)> = (0..100).map(|i| (format!("u{}", i), i)).collect();
    let refs: Vec<(&str, i64, &str, i64)> = people
        .iter()
        .map(|(name, age)| (name.as_str(), *age, "eng", 1))
        .collect();
    insert_people(&engine, &refs);

    std::thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let doc = json!({"operator": "SCAN", "table": "t"});
            for _ in 0..20 {
                // Readers must never observe a torn page or slot array.
                let rows = rows_of(engine.execute(&doc).unwrap());
                assert!(rows.len() <= 100);
                for row in &rows {
                    assert!(row.get("name").is_some());
                }
            }
        });

        let writer = scope.spawn(|| {
            for i in 0..20 {
                let doc = json!({
                    "operator": "DELETE",
                    "table": "t",
                    "column": "name",
                    "value": format!("'u{}'", i)
                });
                engine.execute(&doc).unwrap();
            }
        });

        reader.join().unwrap();
        writer.join().unwrap();
    });

    let doc = json!({"operator": "SCAN", "table": "t"});
    assert_eq!(rows_of(engine.execute(&doc).unwrap()).len(), 80);
}
