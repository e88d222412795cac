mod support;

use mdz::{Entity, GetQuery, IndexSpec, PutQuery, Schema, TableSpec};

fn users_schema() -> Schema {
    Schema::new("test").with_table("Users", TableSpec::new().with_index(IndexSpec::simple("name")))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_put_batches_all_land() -> anyhow::Result<()> {
    const BATCHES: usize = 4;
    const PER_BATCH: usize = 50;

    let fx = support::fixture(users_schema()).await?;

    let mut tasks = Vec::new();
    for batch in 0..BATCHES {
        let driver = fx.driver.clone();
        tasks.push(tokio::spawn(async move {
            let mut put = PutQuery::new("test.Users");
            for i in 0..PER_BATCH {
                put = put.entity(
                    Entity::new()
                        .set("name", format!("batch{batch}"))
                        .set("seq", i as i64),
                );
            }
            driver.put(put).await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        let res = task.await?;
        assert!(res.error.is_none(), "{:?}", res.error);
        assert_eq!(res.ids.len(), PER_BATCH);
        ids.extend(res.ids);
    }

    // K*M distinct rows and exactly as many primary entries
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), BATCHES * PER_BATCH);

    let all = fx.driver.get(GetQuery::new("test.Users").all().limit(1000)).await;
    assert!(all.error.is_none(), "{:?}", all.error);
    assert_eq!(all.total, BATCHES * PER_BATCH);
    assert_eq!(all.entities.len(), BATCHES * PER_BATCH);

    for batch in 0..BATCHES {
        let group = fx
            .driver
            .get(
                GetQuery::new("test.Users")
                    .filter_eq("name", format!("batch{batch}"))
                    .limit(1000),
            )
            .await;
        assert_eq!(group.total, PER_BATCH);
    }
    Ok(())
}
