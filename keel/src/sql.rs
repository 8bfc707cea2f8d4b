use sqlite as sql;

/// Run a function within a database transaction.
pub fn transaction<T, E: From<sql::Error>>(
    db: &sql::Connection,
    f: impl FnOnce(&sql::Connection) -> Result<T, E>,
) -> Result<T, E> {
    db.execute("BEGIN")?;
    match f(db) {
        Ok(value) => {
            db.execute("COMMIT")?;
            Ok(value)
        }
        Err(err) => {
            db.execute("ROLLBACK")?;
            Err(err)
        }
    }
}
