use regex::Regex;
use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait, QueryFilter};
use std::sync::OnceLock;

const MAX_SLUG_LEN: usize = 80;

fn separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("static slug pattern"))
}

/// Lower-case ASCII words joined by `-`; `fallback` when nothing survives.
pub fn slugify(text: &str, fallback: &str) -> String {
    let lowered = text.to_lowercase();
    let joined = separator().replace_all(&lowered, "-");
    let mut slug = joined.trim_matches('-').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug
    }
}

/// First of `base`, `base-2`, `base-3`, ... not yet taken in `column`.
pub async fn unique_slug<E, C>(db: &C, column: E::Column, base: &str) -> Result<String, DbErr>
where
    E: EntityTrait,
    E::Model: Send + Sync + 'static,
    C: ConnectionTrait,
{
    let mut candidate = base.to_string();
    let mut suffix = 2;
    while E::find()
        .filter(column.eq(candidate.clone()))
        .count(db)
        .await?
        > 0
    {
        candidate = format!("{base}-{suffix}");
        suffix += 1;
    }
    Ok(candidate)
}
