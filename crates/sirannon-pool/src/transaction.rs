//! A scoped writer session with implicit `BEGIN`/`COMMIT`/`ROLLBACK`.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::executor::{ExecuteResult, Params, QueryExecutor, Row};
use crate::pool::ConnectionPool;
use crate::write_guard::WriteGuard;

/// A single writer session bounded by `BEGIN` and `COMMIT`/`ROLLBACK`.
///
/// Obtained via [`ConnectionPool::transaction`]. Nested transactions are not
/// supported: a `Transaction` holds the pool's only writer connection for
/// its entire lifetime, so a second `acquire_writer`/`transaction` call made
/// from inside the closure would simply block until this one finishes.
pub struct Transaction<'e> {
   guard: WriteGuard,
   executor: &'e QueryExecutor,
   last_insert_rowid: i64,
}

impl<'e> Transaction<'e> {
   async fn begin(mut guard: WriteGuard, executor: &'e QueryExecutor) -> Result<Self> {
      sqlx::query("BEGIN").execute(&mut *guard).await?;
      Ok(Self {
         guard,
         executor,
         last_insert_rowid: 0,
      })
   }

   pub async fn query(&mut self, sql: &str, params: &Params) -> Result<Vec<Row>> {
      self.executor.query(&mut *self.guard, sql, params).await
   }

   pub async fn query_one(&mut self, sql: &str, params: &Params) -> Result<Option<Row>> {
      self.executor.query_one(&mut *self.guard, sql, params).await
   }

   pub async fn execute(&mut self, sql: &str, params: &Params) -> Result<ExecuteResult> {
      let result = self.executor.execute(&mut *self.guard, sql, params).await?;
      self.last_insert_rowid = result.last_insert_rowid;
      Ok(result)
   }

   pub async fn execute_batch(
      &mut self,
      sql: &str,
      params_batch: &[Params],
   ) -> Result<Vec<ExecuteResult>> {
      let results = self
         .executor
         .execute_batch(&mut self.guard, sql, params_batch)
         .await?;
      if let Some(last) = results.last() {
         self.last_insert_rowid = last.last_insert_rowid;
      }
      Ok(results)
   }

   /// The last inserted rowid observed by this transaction so far.
   pub fn last_insert_rowid(&self) -> i64 {
      self.last_insert_rowid
   }

   async fn commit(mut self) -> Result<()> {
      sqlx::query("COMMIT").execute(&mut *self.guard).await?;
      Ok(())
   }

   async fn rollback(mut self) -> Result<()> {
      // Rollback best-effort: the connection is returned to the pool either
      // way, and the original error from the closure is what the caller sees.
      let _ = sqlx::query("ROLLBACK").execute(&mut *self.guard).await;
      Ok(())
   }
}

impl ConnectionPool {
   /// Run `f` inside a transaction: `BEGIN` on entry, `COMMIT` if `f`
   /// resolves `Ok`, `ROLLBACK` if it resolves `Err`. The writer connection
   /// is held for the full duration.
   ///
   /// `f` returns a boxed future (rather than an `async fn` directly) so its
   /// borrow of `&mut Transaction<'_>` can be expressed with a
   /// higher-ranked lifetime bound; this is the standard shape for a
   /// closure-taking async transaction helper in stable Rust.
   pub async fn transaction<F, T>(&self, executor: &QueryExecutor, f: F) -> Result<T>
   where
      F: for<'t> FnOnce(&'t mut Transaction<'_>) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>,
      T: Send,
   {
      let guard = self.acquire_writer().await?;
      let mut tx = Transaction::begin(guard, executor).await?;
      match f(&mut tx).await {
         Ok(value) => {
            tx.commit().await?;
            Ok(value)
         }
         Err(err) => {
            tx.rollback().await?;
            Err(err)
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::config::PoolConfig;

   #[tokio::test]
   async fn commits_on_success() {
      let dir = tempfile::tempdir().unwrap();
      let pool = ConnectionPool::open(PoolConfig::new(dir.path().join("tx.db")))
         .await
         .unwrap();
      let executor = QueryExecutor::new();

      pool.transaction(&executor, |tx| {
         Box::pin(async move {
            tx.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &Params::none())
               .await?;
            tx.execute(
               "INSERT INTO t (v) VALUES (?)",
               &Params::Positional(vec![serde_json::json!("hello")]),
            )
            .await
         })
      })
      .await
      .unwrap();

      let reader = pool.acquire_reader().unwrap();
      let rows = executor
         .query(reader, "SELECT v FROM t", &Params::none())
         .await
         .unwrap();
      assert_eq!(rows.len(), 1);
      assert_eq!(rows[0]["v"], serde_json::json!("hello"));
   }

   #[tokio::test]
   async fn rolls_back_on_error() {
      let dir = tempfile::tempdir().unwrap();
      let pool = ConnectionPool::open(PoolConfig::new(dir.path().join("tx_err.db")))
         .await
         .unwrap();
      let executor = QueryExecutor::new();

      pool.transaction(&executor, |tx| {
         Box::pin(async move {
            tx.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &Params::none())
               .await?;
            Ok(())
         })
      })
      .await
      .unwrap();

      let result: Result<()> = pool
         .transaction(&executor, |tx| {
            Box::pin(async move {
               tx.execute("INSERT INTO t (id) VALUES (1)", &Params::none())
                  .await?;
               tx.execute("INSERT INTO nonexistent_table (id) VALUES (1)", &Params::none())
                  .await?;
               Ok(())
            })
         })
         .await;
      assert!(result.is_err());

      let reader = pool.acquire_reader().unwrap();
      let rows = executor
         .query(reader, "SELECT id FROM t", &Params::none())
         .await
         .unwrap();
      assert!(rows.is_empty(), "rollback should have discarded the insert");
   }
}
