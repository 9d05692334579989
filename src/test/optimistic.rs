#[cfg(test)]
mod tests {
    use crate::test::support::*;
    use crate::*;
    use crate::{change, record};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn notas_with(h: &Harness, rows: Vec<Record>) -> (Arc<EntityCache>, Optimistic) {
        h.backend.set_table(EntityName::Notas, rows);
        let cache = h.cache(CacheSpec::notas()).await;
        let optimistic = Optimistic::new(cache.clone(), h.backend.clone(), &h.config);
        (cache, optimistic)
    }

    /// Start a refetch that waits at the snapshot gate until released
    async fn held_refetch(h: &Harness, cache: &Arc<EntityCache>) -> tokio::task::JoinHandle<bool> {
        h.backend.hold_snapshots();
        let task = tokio::spawn({
            let cache = cache.clone();
            async move { cache.refetch().await }
        });
        settle().await;
        assert_eq!(cache.phase(), CachePhase::Fetching);
        task
    }

    fn ids(cache: &EntityCache) -> Vec<String> {
        cache.records().iter().filter_map(Record::id).collect()
    }

    fn valor(cache: &EntityCache, id: &str) -> Option<serde_json::Value> {
        cache.get(id).and_then(|r| r.get("valor").cloned())
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_is_visible_before_the_backend_answers() -> Result<()> {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 5 }]).await;
        h.backend.hold_mutations();

        let (saved, _) = tokio::join!(optimistic.update("n1", record! { "valor" => 8 }), async {
            settle().await;
            // Local edit applied, server row not installed yet
            assert_eq!(valor(&cache, "n1"), Some(json!(8)));
            assert!(cache.get("n1").is_some_and(|r| r.get("updated_at").is_none()));
            h.backend.release_mutations(1);
        });

        let saved = saved?;
        assert_eq!(saved.get_str("updated_at"), Some("2024-05-01T12:00:00Z"));
        assert_eq!(cache.get("n1"), Some(saved));

        // Reconciled row is present, so the safety check does not refetch
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.backend.snapshot_count(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_rolls_back() {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 5 }]).await;
        h.backend.fail_mutations(true);
        let revision = cache.revision();

        let result = optimistic.update("n1", record! { "valor" => 10 }).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(valor(&cache, "n1"), Some(json!(5)));
        // One commit for the local edit, one for the rollback
        assert_eq!(cache.revision(), revision + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_yields_to_a_newer_live_event() {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 5 }]).await;
        h.backend.fail_mutations(true);
        h.backend.hold_mutations();

        let (result, _) = tokio::join!(optimistic.update("n1", record! { "valor" => 10 }), async {
            settle().await;
            h.feed.emit(change!(Update, EntityName::Notas, record! { "id" => "n1", "valor" => 7 }));
            settle().await;
            h.backend.release_mutations(1);
        });

        assert!(result.is_err());
        assert_eq!(valor(&cache, "n1"), Some(json!(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_immediately() -> Result<()> {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(
            &h,
            vec![record! { "id" => "n1" }, record! { "id" => "n2" }],
        )
        .await;
        h.backend.hold_mutations();

        let (deleted, _) = tokio::join!(optimistic.delete("n1"), async {
            settle().await;
            assert!(cache.get("n1").is_none());
            h.backend.release_mutations(1);
        });

        assert!(deleted?);
        assert_eq!(h.backend.table_ids(EntityName::Notas), vec!["n2"]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.backend.snapshot_count(), 1);
        assert!(cache.get("n1").is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_not_found_restores_row() -> Result<()> {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![]).await;
        // Row known locally but already gone on the server
        cache.handle_event(&change!(Insert, EntityName::Notas, record! { "id" => "ghost", "valor" => 1 }));

        assert!(!optimistic.delete("ghost").await?);
        assert_eq!(valor(&cache, "ghost"), Some(json!(1)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delete_restores_row() {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 3 }]).await;
        h.backend.fail_delete_of("n1");

        assert!(optimistic.delete("n1").await.is_err());
        assert_eq!(valor(&cache, "n1"), Some(json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_swaps_in_server_assigned_id() -> Result<()> {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![]).await;
        h.backend.assign_created_id("srv-1");

        let saved = optimistic
            .create(record! { "id" => "tmp-1", "valor" => 9 })
            .await?;

        assert_eq!(saved.id().as_deref(), Some("srv-1"));
        assert!(cache.get("tmp-1").is_none());
        assert_eq!(valor(&cache, "srv-1"), Some(json!(9)));
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_removes_provisional_row() {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![]).await;
        h.backend.fail_mutations(true);

        assert!(optimistic.create(record! { "id" => "tmp-1" }).await.is_err());
        assert!(cache.is_empty());

        let missing_id = optimistic.create(record! { "valor" => 2 }).await;
        assert!(matches!(missing_id, Err(Error::InvalidRecord(_))));
        assert_eq!(h.backend.calls(), vec!["create notas"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_check_refetches_when_row_went_missing() -> Result<()> {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 5 }]).await;

        optimistic.update("n1", record! { "valor" => 6 }).await?;
        // A stray delete leaves the cache disagreeing with the backend
        h.feed.emit(change!(Delete, EntityName::Notas, id = "n1"));
        settle().await;
        assert!(cache.get("n1").is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.backend.snapshot_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(h.backend.snapshot_count(), 2);
        assert_eq!(valor(&cache, "n1"), Some(json!(6)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_during_snapshot_stays_rolled_back() {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 5 }]).await;
        let refetch = held_refetch(&h, &cache).await;
        h.backend.fail_mutations(true);

        assert!(optimistic.create(record! { "id" => "ghost", "valor" => 1 }).await.is_err());
        assert!(cache.get("ghost").is_none());
        assert_eq!(cache.pending_len(), 0);

        h.backend.release_snapshots(1);
        assert!(refetch.await.expect("refetch task"));
        assert!(cache.get("ghost").is_none());
        assert_eq!(ids(&cache), vec!["n1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_during_snapshot_keeps_server_row() {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 5 }]).await;
        let refetch = held_refetch(&h, &cache).await;
        h.backend.fail_mutations(true);

        assert!(optimistic.update("n1", record! { "valor" => 10 }).await.is_err());
        assert_eq!(valor(&cache, "n1"), Some(json!(5)));

        h.backend.release_snapshots(1);
        assert!(refetch.await.expect("refetch task"));
        assert_eq!(valor(&cache, "n1"), Some(json!(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_confirmed_during_snapshot_keeps_saved_row() -> Result<()> {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 5 }]).await;
        // The snapshot read the row before the update reached the backend
        let refetch = held_refetch(&h, &cache).await;

        let saved = optimistic.update("n1", record! { "valor" => 8 }).await?;
        assert_eq!(cache.get("n1"), Some(saved.clone()));

        h.backend.release_snapshots(1);
        assert!(refetch.await.expect("refetch task"));
        assert_eq!(cache.get("n1"), Some(saved));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.backend.snapshot_count(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_event_before_confirmation_during_snapshot() -> Result<()> {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 5 }]).await;
        let refetch = held_refetch(&h, &cache).await;
        h.backend.hold_mutations();

        let server_row = record! { "id" => "n1", "valor" => 8, "updated_at" => "2024-05-01T12:00:00Z" };
        let (saved, _) = tokio::join!(optimistic.update("n1", record! { "valor" => 8 }), async {
            settle().await;
            h.feed.emit(change!(Update, EntityName::Notas, server_row.clone()));
            settle().await;
            h.backend.release_mutations(1);
        });
        let saved = saved?;
        assert_eq!(saved, server_row);

        h.backend.release_snapshots(1);
        assert!(refetch.await.expect("refetch task"));
        assert_eq!(cache.get("n1"), Some(server_row));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_with_server_id_during_snapshot() -> Result<()> {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1" }]).await;
        let refetch = held_refetch(&h, &cache).await;
        h.backend.assign_created_id("srv-1");

        let saved = optimistic.create(record! { "id" => "tmp-1", "valor" => 9 }).await?;

        h.backend.release_snapshots(1);
        assert!(refetch.await.expect("refetch task"));
        assert!(cache.get("tmp-1").is_none());
        assert_eq!(cache.get("srv-1"), Some(saved));
        assert_eq!(cache.len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_confirmed_during_snapshot_stays_deleted() -> Result<()> {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(
            &h,
            vec![record! { "id" => "n1" }, record! { "id" => "n2" }],
        )
        .await;
        // The held snapshot still contains n1
        let refetch = held_refetch(&h, &cache).await;

        assert!(optimistic.delete("n1").await?);

        h.backend.release_snapshots(1);
        assert!(refetch.await.expect("refetch task"));
        assert_eq!(ids(&cache), vec!["n2"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delete_during_snapshot_restores_row() {
        let h = Harness::new();
        let (cache, optimistic) = notas_with(&h, vec![record! { "id" => "n1", "valor" => 3 }]).await;
        let refetch = held_refetch(&h, &cache).await;
        h.backend.fail_delete_of("n1");

        assert!(optimistic.delete("n1").await.is_err());
        assert_eq!(valor(&cache, "n1"), Some(json!(3)));
        assert_eq!(cache.pending_len(), 0);

        h.backend.release_snapshots(1);
        assert!(refetch.await.expect("refetch task"));
        assert_eq!(valor(&cache, "n1"), Some(json!(3)));
    }
}
