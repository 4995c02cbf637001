//! PostgreSQL brand reference store.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use kvitto_core::{
    AliasEmbedding, Brand, BrandRepository, CreateBrandRequest, Error, Result,
};

/// PostgreSQL implementation of [`BrandRepository`].
pub struct PgBrandRepository {
    pool: PgPool,
}

impl PgBrandRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BrandRepository for PgBrandRepository {
    async fn create(&self, req: CreateBrandRequest) -> Result<Brand> {
        let mut tx = self.pool.begin().await?;

        let id = Uuid::now_v7();
        let row = sqlx::query(
            r#"INSERT INTO brands (id, name, website, metadata)
               VALUES ($1, $2, $3, $4)
               RETURNING id, name, website, metadata, created_at, updated_at"#,
        )
        .bind(id)
        .bind(&req.name)
        .bind(&req.website)
        .bind(&req.metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_name_conflict(e, &req.name))?;

        // The canonical name is itself an alias so the matcher needs no
        // special case for it.
        let mut aliases = vec![req.name.clone()];
        for alias in &req.aliases {
            if !aliases.iter().any(|a| a.eq_ignore_ascii_case(alias)) {
                aliases.push(alias.clone());
            }
        }
        for alias in &aliases {
            sqlx::query(
                r#"INSERT INTO brand_aliases (id, brand_id, alias)
                   VALUES ($1, $2, $3)
                   ON CONFLICT (brand_id, alias) DO NOTHING"#,
            )
            .bind(Uuid::now_v7())
            .bind(id)
            .bind(alias)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        brand_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Brand> {
        let row = sqlx::query(
            r#"SELECT id, name, website, metadata, created_at, updated_at
               FROM brands WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Brand {} not found", id)))?;

        brand_from_row(&row)
    }

    async fn set_alias_embedding(
        &self,
        brand_id: Uuid,
        alias: &str,
        embedding: &Vector,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO brand_aliases (id, brand_id, alias, embedding)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (brand_id, alias) DO UPDATE SET embedding = EXCLUDED.embedding"#,
        )
        .bind(Uuid::now_v7())
        .bind(brand_id)
        .bind(alias)
        .bind(embedding)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn alias_embeddings(&self) -> Result<Vec<AliasEmbedding>> {
        let rows = sqlx::query(
            r#"SELECT ba.brand_id, b.name AS brand_name, ba.alias, ba.embedding
               FROM brand_aliases ba
               JOIN brands b ON b.id = ba.brand_id
               WHERE ba.embedding IS NOT NULL
               ORDER BY b.name, ba.alias"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| AliasEmbedding {
                brand_id: row.get("brand_id"),
                brand_name: row.get("brand_name"),
                alias: row.get("alias"),
                embedding: row.get("embedding"),
            })
            .collect())
    }
}

fn map_name_conflict(e: sqlx::Error, name: &str) -> Error {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.code().as_deref() == Some("23505") {
            return Error::DuplicateContent(format!("brand name '{}' already exists", name));
        }
    }
    Error::Database(e)
}

fn brand_from_row(row: &sqlx::postgres::PgRow) -> Result<Brand> {
    Ok(Brand {
        id: row.get("id"),
        name: row.get("name"),
        website: row.get("website"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
