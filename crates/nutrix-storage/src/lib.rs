//! Nutrix Storage
//!
//! SQLite persistence for user profiles and meal records

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MealType {
    Breakfast,
    Lunch,
    Dinner,
    #[default]
    Snack,
}

impl MealType {
    /// Menu order; the 1-based position is the digit users reply with.
    pub const ALL: [MealType; 4] = [
        MealType::Breakfast,
        MealType::Lunch,
        MealType::Dinner,
        MealType::Snack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MealType::Breakfast => "breakfast",
            MealType::Lunch => "lunch",
            MealType::Dinner => "dinner",
            MealType::Snack => "snack",
        }
    }

    /// Display name in the source language, also the localization key.
    pub fn source_name(&self) -> &'static str {
        match self {
            MealType::Breakfast => "Breakfast",
            MealType::Lunch => "Lunch",
            MealType::Dinner => "Dinner",
            MealType::Snack => "Snack",
        }
    }

    pub fn menu_digit(&self) -> char {
        match self {
            MealType::Breakfast => '1',
            MealType::Lunch => '2',
            MealType::Dinner => '3',
            MealType::Snack => '4',
        }
    }

    /// Unknown stored values collapse to the default type.
    pub fn from_db(value: &str) -> Self {
        match value {
            "breakfast" => MealType::Breakfast,
            "lunch" => MealType::Lunch,
            "dinner" => MealType::Dinner,
            _ => MealType::Snack,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Option<i64>,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub registration_date: DateTime<Utc>,
    pub goals: serde_json::Value,
}

impl UserProfile {
    pub fn new(
        telegram_id: i64,
        username: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Self {
        Self {
            id: None,
            telegram_id,
            username,
            first_name,
            last_name,
            registration_date: Utc::now(),
            goals: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MealRecord {
    pub id: Option<i64>,
    pub user_id: i64,
    pub timestamp: DateTime<Utc>,
    pub meal_type: MealType,
    pub food_name: String,
    pub calories: f64,
    pub proteins: f64,
    pub fats: f64,
    pub carbs: f64,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MacroTotals {
    pub calories: f64,
    pub proteins: f64,
    pub fats: f64,
    pub carbs: f64,
}

#[derive(Debug, Clone)]
pub struct UserStats {
    pub total: MacroTotals,
    /// Per day over the requested window, not per meal.
    pub average: MacroTotals,
    pub meals_count: usize,
    pub days: u32,
}

pub struct Storage {
    conn: rusqlite::Connection,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER NOT NULL UNIQUE,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                registration_date TEXT NOT NULL,
                goals TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS meals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                meal_type TEXT NOT NULL DEFAULT 'snack',
                food_name TEXT NOT NULL,
                calories REAL NOT NULL,
                proteins REAL NOT NULL,
                fats REAL NOT NULL,
                carbs REAL NOT NULL,
                image_url TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_meals_user_timestamp
            ON meals(user_id, timestamp);
            ",
        )?;

        Ok(Self { conn })
    }

    /// Insert or update the profile keyed by telegram id. Returns the row id.
    pub fn save_user(&self, profile: &UserProfile) -> Result<i64> {
        let goals = serde_json::to_string(&profile.goals)?;
        self.conn.execute(
            "INSERT INTO users (telegram_id, username, first_name, last_name, registration_date, goals)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(telegram_id)
             DO UPDATE SET username = excluded.username,
                           first_name = excluded.first_name,
                           last_name = excluded.last_name,
                           goals = excluded.goals",
            (
                profile.telegram_id,
                &profile.username,
                &profile.first_name,
                &profile.last_name,
                profile.registration_date.to_rfc3339(),
                goals,
            ),
        )?;

        let id = self.conn.query_row(
            "SELECT id FROM users WHERE telegram_id = ?1",
            [profile.telegram_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_user(&self, telegram_id: i64) -> Result<Option<UserProfile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, telegram_id, username, first_name, last_name, registration_date, goals
             FROM users WHERE telegram_id = ?1 LIMIT 1",
        )?;

        let profile = stmt
            .query_row([telegram_id], |row| {
                Ok(UserProfile {
                    id: Some(row.get(0)?),
                    telegram_id: row.get(1)?,
                    username: row.get(2)?,
                    first_name: row.get(3)?,
                    last_name: row.get(4)?,
                    registration_date: parse_timestamp(row, 5)?,
                    goals: parse_goals(row, 6)?,
                })
            })
            .optional()?;

        Ok(profile)
    }

    pub fn save_meal(&self, meal: &MealRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO meals (user_id, timestamp, meal_type, food_name, calories, proteins, fats, carbs, image_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            (
                meal.user_id,
                meal.timestamp.to_rfc3339(),
                meal.meal_type.as_str(),
                &meal.food_name,
                meal.calories,
                meal.proteins,
                meal.fats,
                meal.carbs,
                &meal.image_url,
            ),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Meals for a user, newest first, optionally bounded to a time window.
    pub fn get_meals(
        &self,
        user_id: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<MealRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, timestamp, meal_type, food_name, calories, proteins, fats, carbs, image_url
             FROM meals
             WHERE user_id = ?1
               AND (?2 IS NULL OR timestamp >= ?2)
               AND (?3 IS NULL OR timestamp <= ?3)
             ORDER BY timestamp DESC",
        )?;

        let rows = stmt.query_map(
            (
                user_id,
                from.map(|dt| dt.to_rfc3339()),
                to.map(|dt| dt.to_rfc3339()),
            ),
            |row| {
                let meal_type: String = row.get(3)?;
                Ok(MealRecord {
                    id: Some(row.get(0)?),
                    user_id: row.get(1)?,
                    timestamp: parse_timestamp(row, 2)?,
                    meal_type: MealType::from_db(&meal_type),
                    food_name: row.get(4)?,
                    calories: row.get(5)?,
                    proteins: row.get(6)?,
                    fats: row.get(7)?,
                    carbs: row.get(8)?,
                    image_url: row.get(9)?,
                })
            },
        )?;

        let mut meals = Vec::new();
        for meal in rows {
            meals.push(meal?);
        }
        Ok(meals)
    }

    /// Nutrition totals plus per-day averages over the last `days` days.
    pub fn get_user_stats(&self, user_id: i64, days: u32) -> Result<UserStats> {
        let end = Utc::now();
        let start = end - Duration::days(days as i64);

        let meals = self.get_meals(user_id, Some(start), Some(end))?;

        let mut total = MacroTotals::default();
        for meal in &meals {
            total.calories += meal.calories;
            total.proteins += meal.proteins;
            total.fats += meal.fats;
            total.carbs += meal.carbs;
        }

        let mut average = MacroTotals::default();
        if days > 0 {
            let d = days as f64;
            average.calories = total.calories / d;
            average.proteins = total.proteins / d;
            average.fats = total.fats / d;
            average.carbs = total.carbs / d;
        }

        Ok(UserStats {
            total,
            average,
            meals_count: meals.len(),
            days,
        })
    }
}

fn parse_timestamp(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_goals(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
