//! Restores the "no row above head" invariant across item tables, either at
//! startup or after a reorg is detected.

use tracing::info;

use crate::error::StoreError;
use crate::source::BlockRef;
use crate::store::StoreAdapter;

/// Delete every row with `block_number > head.number` from every item table.
/// With `head = None` (empty `blocks` table), every row is deleted.
pub async fn reconcile(
    store: &StoreAdapter,
    database: &str,
    item_tables: &[String],
    head: Option<&BlockRef>,
) -> Result<(), StoreError> {
    let predicate = match head {
        Some(head) => format!("block_number > {}", head.number),
        None => "block_number >= 0".to_owned(),
    };

    for table in item_tables {
        let sql = format!("ALTER TABLE {table} DELETE WHERE {predicate}");
        info!(table = %table, predicate = %predicate, "reconciling item table");
        store.command(database, &sql).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn deletes_rows_above_head_in_every_item_table() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/").with_status(200).with_body("").expect(2).create_async().await;

        let store = StoreAdapter::new(server.url());
        let head = BlockRef { number: 41, hash: "h41".into() };
        reconcile(&store, "db", &["a".to_owned(), "b".to_owned()], Some(&head)).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn deletes_every_row_when_there_is_no_head() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("block_number >= 0".to_string()))
            .with_status(200)
            .with_body("")
            .expect(1)
            .create_async()
            .await;

        let store = StoreAdapter::new(server.url());
        reconcile(&store, "db", &["a".to_owned()], None).await.unwrap();

        mock.assert_async().await;
    }
}
