use sqlx::Row;

use crate::{Store, StoreError};

/// Ids needed to attach an event to an already-known reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorRef {
    pub reactor_id: i64,
    pub site_id: Option<i64>,
}

impl Store {
    pub async fn reactor_by_docket(&self, docket: &str) -> Result<Option<ReactorRef>, StoreError> {
        let row = sqlx::query("SELECT id, site_id FROM reactors WHERE nrc_docket_number = ?")
            .bind(docket.trim())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ReactorRef {
            reactor_id: row.try_get("id")?,
            site_id: row.try_get("site_id")?,
        }))
    }

    /// Site id for a plant name as it appears in third-party reports. An exact
    /// name wins; otherwise the shortest site name containing it, ignoring case.
    pub async fn site_id_by_name(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        let exact = sqlx::query_scalar("SELECT id FROM sites WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        if exact.is_some() {
            return Ok(exact);
        }
        let id = sqlx::query_scalar(
            "SELECT id FROM sites WHERE instr(lower(name), lower(?)) > 0 \
             ORDER BY length(name), id LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuketrack_core::{Record, REACTORS, SITES};

    #[tokio::test]
    async fn known_docket_resolves_to_reactor_and_site() {
        let store = Store::connect_in_memory().await.unwrap();
        let site = store.upsert(&SITES, &Record::new("Arkansas Nuclear")).await.unwrap();
        let reactor = store
            .upsert(
                &REACTORS,
                &Record::new("05000313")
                    .with("name", "Arkansas Nuclear 1")
                    .with("site_id", site.entity_id),
            )
            .await
            .unwrap();

        let found = store.reactor_by_docket("05000313").await.unwrap();
        assert_eq!(
            found,
            Some(ReactorRef {
                reactor_id: reactor.entity_id,
                site_id: Some(site.entity_id),
            })
        );
        assert_eq!(store.reactor_by_docket("05000999").await.unwrap(), None);
    }

    #[tokio::test]
    async fn site_names_match_exactly_then_by_containment() {
        let store = Store::connect_in_memory().await.unwrap();
        let vogtle = store.upsert(&SITES, &Record::new("Vogtle")).await.unwrap();
        let indian_point = store
            .upsert(&SITES, &Record::new("Indian Point Energy Center"))
            .await
            .unwrap();
        store.upsert(&SITES, &Record::new("Vogtle Electric Generating Plant")).await.unwrap();

        assert_eq!(store.site_id_by_name(" Vogtle ").await.unwrap(), Some(vogtle.entity_id));
        assert_eq!(
            store.site_id_by_name("indian point").await.unwrap(),
            Some(indian_point.entity_id)
        );
        assert_eq!(store.site_id_by_name("Zion").await.unwrap(), None);
        assert_eq!(store.site_id_by_name("   ").await.unwrap(), None);
    }
}
