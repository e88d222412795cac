mod support;

use mdz::{
    Change, ChangeOp, DelQuery, Entity, ErrorKind, Filter, GetQuery, IndexSpec, PutQuery, Schema,
    TableSpec, UpdateQuery, Value,
};

fn users_schema() -> Schema {
    Schema::new("test").with_table("Users", TableSpec::new().with_index(IndexSpec::simple("name")))
}

#[tokio::test]
async fn put_then_get_by_secondary() -> anyhow::Result<()> {
    let fx = support::fixture(users_schema()).await?;

    let res = fx
        .driver
        .put(
            PutQuery::new("test.Users")
                .entity(Entity::new().set("name", "alice"))
                .entity(Entity::new().set("name", "bob")),
        )
        .await;
    assert!(res.error.is_none(), "{:?}", res.error);
    assert_eq!(res.ids.len(), 2);
    assert!(res.ids.iter().all(|id| !id.is_null()));
    assert_ne!(res.ids[0], res.ids[1]);

    let get = fx
        .driver
        .get(GetQuery::new("test.Users").filter_eq("name", "alice"))
        .await;
    assert!(get.error.is_none(), "{:?}", get.error);
    assert_eq!(get.total, 1);
    assert_eq!(get.entities.len(), 1);
    assert_eq!(get.entities[0].get("name"), Some(&Value::from("alice")));
    assert_eq!(get.entities[0].id, res.ids[0]);
    Ok(())
}

#[tokio::test]
async fn update_reindexes_renamed_rows() -> anyhow::Result<()> {
    let fx = support::fixture(users_schema()).await?;

    let put = fx
        .driver
        .put(PutQuery::new("test.Users").entity(
            Entity::new().set("name", "alice").set("email", "a@b.c"),
        ))
        .await;
    assert!(put.error.is_none(), "{:?}", put.error);

    let update = fx
        .driver
        .update(
            UpdateQuery::new("test.Users")
                .filter(Filter::eq("name", "alice"))
                .set("name", "carol")
                .increment("count", 100)
                .del_property("email"),
        )
        .await;
    assert!(update.error.is_none(), "{:?}", update.error);
    assert_eq!(update.num, 1);

    let stale = fx
        .driver
        .get(GetQuery::new("test.Users").filter_eq("name", "alice"))
        .await;
    assert!(stale.error.is_none(), "{:?}", stale.error);
    assert!(stale.entities.is_empty());

    let fresh = fx
        .driver
        .get(GetQuery::new("test.Users").filter_eq("name", "carol"))
        .await;
    assert!(fresh.error.is_none(), "{:?}", fresh.error);
    assert_eq!(fresh.entities.len(), 1);
    let entity = &fresh.entities[0];
    assert!(entity.get("count").and_then(Value::as_int).unwrap_or(0) >= 100);
    assert!(entity.get("email").is_none());
    Ok(())
}

#[tokio::test]
async fn get_by_id_and_partial_projection() -> anyhow::Result<()> {
    let fx = support::fixture(users_schema()).await?;

    let put = fx
        .driver
        .put(PutQuery::new("test.Users").entity(
            Entity::new().set("name", "dana").set("email", "d@b.c"),
        ))
        .await;
    let id = put.ids[0].clone();

    let by_id = fx
        .driver
        .get(GetQuery::new("test.Users").filter_eq("id", id.as_str()))
        .await;
    assert!(by_id.error.is_none(), "{:?}", by_id.error);
    assert_eq!(by_id.entities.len(), 1);
    assert_eq!(by_id.entities[0].properties.len(), 2);

    let projected = fx
        .driver
        .get(
            GetQuery::new("test.Users")
                .filter_eq("id", id.as_str())
                .fields(&["name"]),
        )
        .await;
    assert!(projected.error.is_none(), "{:?}", projected.error);
    assert_eq!(projected.entities.len(), 1);
    let entity = &projected.entities[0];
    assert_eq!(entity.id, id);
    assert_eq!(entity.properties.len(), 1);
    assert_eq!(entity.get("name"), Some(&Value::from("dana")));
    Ok(())
}

#[tokio::test]
async fn typed_values_roundtrip_through_storage() -> anyhow::Result<()> {
    let fx = support::fixture(users_schema()).await?;

    let entity = Entity::new()
        .set("name", "typed")
        .set("age", 42i64)
        .set("balance", -12.5f64)
        .set("active", true)
        .set(
            "tags",
            Value::List(vec![Value::from("a"), Value::from("b")]),
        );
    let put = fx.driver.put(PutQuery::new("test.Users").entity(entity)).await;
    assert!(put.error.is_none(), "{:?}", put.error);

    let get = fx
        .driver
        .get(GetQuery::new("test.Users").filter_eq("name", "typed"))
        .await;
    let entity = &get.entities[0];
    assert_eq!(entity.get("age"), Some(&Value::Int(42)));
    assert_eq!(entity.get("balance"), Some(&Value::Float(-12.5)));
    assert_eq!(entity.get("active"), Some(&Value::Bool(true)));
    assert_eq!(
        entity.get("tags"),
        Some(&Value::List(vec![Value::from("a"), Value::from("b")]))
    );
    Ok(())
}

#[tokio::test]
async fn unknown_tables_and_bad_queries_error() -> anyhow::Result<()> {
    let fx = support::fixture(users_schema()).await?;

    let res = fx
        .driver
        .get(GetQuery::new("test.Nope").filter_eq("name", "x"))
        .await;
    assert!(matches!(
        res.error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::InvalidTable(_))
    ));

    // filterless queries never reach the backend
    let res = fx.driver.get(GetQuery::new("test.Users")).await;
    assert!(matches!(
        res.error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::Validation(_))
    ));

    // declared-but-unsupported ops are rejected up front
    let mut change = Change::set("tags", "x");
    change.op = ChangeOp::SetAdd;
    let res = fx
        .driver
        .update(UpdateQuery {
            table: "test.Users".into(),
            filters: [Filter::eq("name", "a")].into_iter().collect(),
            changes: vec![change],
        })
        .await;
    assert!(matches!(
        res.error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::OpNotSupported(_))
    ));
    Ok(())
}

#[tokio::test]
async fn paging_by_id_honors_the_offset() -> anyhow::Result<()> {
    let fx = support::fixture(users_schema()).await?;

    let mut put = PutQuery::new("test.Users");
    for i in 0..5 {
        put = put.entity(Entity::new().set("name", format!("user{i}")));
    }
    let put = fx.driver.put(put).await;
    assert!(put.error.is_none(), "{:?}", put.error);
    let id_values: Vec<Value> = put.ids.iter().map(|id| Value::from(id.as_str())).collect();

    let window = fx
        .driver
        .get(
            GetQuery::new("test.Users")
                .filter_in("id", id_values.clone())
                .page(2, 2),
        )
        .await;
    assert!(window.error.is_none(), "{:?}", window.error);
    assert_eq!(window.total, 5);
    assert_eq!(window.entities.len(), 2);
    assert_eq!(window.entities[0].id, put.ids[2]);
    assert_eq!(window.entities[1].id, put.ids[3]);

    let tail = fx
        .driver
        .get(
            GetQuery::new("test.Users")
                .filter_in("id", id_values.clone())
                .page(4, 10),
        )
        .await;
    assert_eq!(tail.total, 5);
    assert_eq!(tail.entities.len(), 1);
    assert_eq!(tail.entities[0].id, put.ids[4]);

    // an offset past the matches returns nothing, not the unsliced list
    let past = fx
        .driver
        .get(
            GetQuery::new("test.Users")
                .filter_in("id", id_values)
                .page(7, 5),
        )
        .await;
    assert!(past.error.is_none(), "{:?}", past.error);
    assert_eq!(past.total, 5);
    assert!(past.entities.is_empty());
    Ok(())
}

#[tokio::test]
async fn update_with_no_matches_affects_nothing() -> anyhow::Result<()> {
    let fx = support::fixture(users_schema()).await?;

    let res = fx
        .driver
        .update(
            UpdateQuery::new("test.Users")
                .filter(Filter::eq("name", "nobody"))
                .set("name", "somebody"),
        )
        .await;
    assert!(res.error.is_none(), "{:?}", res.error);
    assert_eq!(res.num, 0);
    Ok(())
}

#[tokio::test]
async fn delete_removes_rows_and_entries() -> anyhow::Result<()> {
    let fx = support::fixture(users_schema()).await?;

    fx.driver
        .put(
            PutQuery::new("test.Users")
                .entity(Entity::new().set("name", "gone"))
                .entity(Entity::new().set("name", "stays")),
        )
        .await;

    let del = fx
        .driver
        .delete(DelQuery::new("test.Users").filter(Filter::eq("name", "gone")))
        .await;
    assert!(del.error.is_none(), "{:?}", del.error);
    assert_eq!(del.num, 1);

    let gone = fx
        .driver
        .get(GetQuery::new("test.Users").filter_eq("name", "gone"))
        .await;
    assert!(gone.entities.is_empty());
    assert_eq!(gone.total, 0);

    let stays = fx
        .driver
        .get(GetQuery::new("test.Users").filter_eq("name", "stays"))
        .await;
    assert_eq!(stays.entities.len(), 1);
    Ok(())
}

#[tokio::test]
async fn ping_and_status() -> anyhow::Result<()> {
    let fx = support::fixture(users_schema()).await?;

    let pong = fx.driver.ping().await;
    assert!(pong.error.is_none(), "{:?}", pong.error);

    fx.driver.status().await?;
    Ok(())
}
